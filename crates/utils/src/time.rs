use chrono::Utc;

/// Current time as epoch milliseconds. Event payloads and Gantt math use
/// millisecond timestamps; database rows use `DateTime<Utc>` columns.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_reasonable() {
        // 2020-01-01 in ms
        assert!(now_ms() > 1_577_836_800_000);
    }
}
