use sqlx::PgPool;

/// Process-wide settings stored as key/value strings. Read on demand with
/// no in-memory cache, so horizontally scaled instances see updates immediately.
pub struct GlobalSettings;

/// Pulse guardrail configuration resolved from `global_settings` with the
/// shipped defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseSettings {
    pub pulse_interval_minutes: u64,
    pub wake_enabled: bool,
    pub wake_cooldown_sec: i64,
    pub max_wakes_per_day: i64,
    pub max_wakes_per_pair_per_day: i64,
    pub max_concurrent_pulse_sessions: usize,
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            pulse_interval_minutes: 30,
            wake_enabled: true,
            wake_cooldown_sec: 300,
            max_wakes_per_day: 12,
            max_wakes_per_pair_per_day: 5,
            max_concurrent_pulse_sessions: 2,
        }
    }
}

impl GlobalSettings {
    pub async fn get(pool: &PgPool, key: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT value FROM global_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
    }

    pub async fn set(pool: &PgPool, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO global_settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn pulse_settings(pool: &PgPool) -> Result<PulseSettings, sqlx::Error> {
        let defaults = PulseSettings::default();
        let get = |key: &'static str| Self::get(pool, key);

        let pulse_interval_minutes = get("pulseIntervalMinutes")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.pulse_interval_minutes);
        let wake_enabled = get("wakeEnabled")
            .await?
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.wake_enabled);
        let wake_cooldown_sec = get("wakeCooldownSec")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.wake_cooldown_sec);
        let max_wakes_per_day = get("maxWakesPerDay")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_wakes_per_day);
        let max_wakes_per_pair_per_day = get("maxWakesPerPairPerDay")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_wakes_per_pair_per_day);
        let max_concurrent_pulse_sessions = get("maxConcurrentPulseSessions")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_concurrent_pulse_sessions);

        Ok(PulseSettings {
            pulse_interval_minutes,
            wake_enabled,
            wake_cooldown_sec,
            max_wakes_per_day,
            max_wakes_per_pair_per_day,
            max_concurrent_pulse_sessions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_settings() {
        let s = PulseSettings::default();
        assert_eq!(s.pulse_interval_minutes, 30);
        assert!(s.wake_enabled);
        assert_eq!(s.wake_cooldown_sec, 300);
        assert_eq!(s.max_wakes_per_day, 12);
        assert_eq!(s.max_wakes_per_pair_per_day, 5);
        assert_eq!(s.max_concurrent_pulse_sessions, 2);
    }
}
