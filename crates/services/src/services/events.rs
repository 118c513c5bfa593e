use redis::{AsyncCommands, aio::ConnectionManager};
use serde_json::{Value, json};
use uuid::Uuid;

use utils::time::now_ms;

/// Broadcast channel consumed by the dashboard SSE bridge.
pub const GLOBAL_STREAM: &str = "djinnbot:events:global";
/// Single-reader queue from the dispatcher to the worker pool. Workers read
/// it as a consumer group, so exactly one worker claims each message.
pub const NEW_RUNS_STREAM: &str = "djinnbot:events:new_runs";

/// Per-run control channel (HUMAN_INTERVENTION, resume signals).
pub fn run_stream(run_id: Uuid) -> String {
    format!("djinnbot:events:run:{run_id}")
}

/// Result key polled while waiting for the engine to create a worktree.
pub fn workspace_result_key(agent_id: &str, task_id: Uuid) -> String {
    format!("djinnbot:workspace:{agent_id}:{task_id}")
}

/// Append-only event delivery over Redis streams.
///
/// Publishing is best-effort: the database commit that preceded an event is
/// the source of truth, so a failed publish is logged and swallowed, never
/// surfaced to the caller. Consumers are expected to be idempotent.
#[derive(Clone)]
pub struct EventService {
    conn: Option<ConnectionManager>,
}

impl EventService {
    pub async fn connect(redis_url: &str) -> Self {
        match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => Self { conn: Some(conn) },
                Err(e) => {
                    tracing::warn!("EventService: redis unavailable, events disabled: {e}");
                    Self { conn: None }
                }
            },
            Err(e) => {
                tracing::warn!("EventService: invalid redis url, events disabled: {e}");
                Self { conn: None }
            }
        }
    }

    /// An EventService that drops every event. Used by tests.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Publish a typed event to the global stream. The payload gains a server
    /// timestamp in milliseconds.
    pub async fn publish_global(&self, event_type: &str, mut data: Value) {
        if let Some(obj) = data.as_object_mut() {
            obj.insert("type".to_string(), json!(event_type));
            obj.insert("timestamp".to_string(), json!(now_ms()));
        }
        self.xadd(GLOBAL_STREAM, &[("data", data.to_string())]).await;
    }

    /// Signal the worker pool that a run is waiting. Signal only; the engine
    /// fetches full run data via the API.
    pub async fn publish_new_run(&self, run_id: Uuid, pipeline_id: &str) {
        self.xadd(
            NEW_RUNS_STREAM,
            &[
                ("event", "run:new".to_string()),
                ("run_id", run_id.to_string()),
                ("pipeline_id", pipeline_id.to_string()),
            ],
        )
        .await;
    }

    /// Publish a control event on a run's own stream.
    pub async fn publish_run_event(&self, run_id: Uuid, event_type: &str, mut data: Value) {
        if let Some(obj) = data.as_object_mut() {
            obj.insert("type".to_string(), json!(event_type));
            obj.insert("runId".to_string(), json!(run_id));
            obj.insert("timestamp".to_string(), json!(now_ms()));
        }
        self.xadd(&run_stream(run_id), &[("data", data.to_string())])
            .await;
    }

    /// Read back a run's event log. Missing streams read as empty.
    pub async fn run_log(&self, run_id: Uuid) -> Vec<Value> {
        let Some(conn) = &self.conn else {
            return Vec::new();
        };
        let mut conn = conn.clone();
        let entries: Vec<(String, Vec<(String, String)>)> = match redis::cmd("XRANGE")
            .arg(run_stream(run_id))
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("run_log: failed to read stream for {run_id}: {e}");
                return Vec::new();
            }
        };
        entries
            .into_iter()
            .flat_map(|(_, fields)| fields)
            .filter(|(k, _)| k == "data")
            .map(|(_, raw)| {
                serde_json::from_str(&raw).unwrap_or_else(|_| json!({ "raw": raw }))
            })
            .collect()
    }

    /// Fetch and decode a JSON value stored under a plain key. Used for the
    /// worktree result handshake.
    pub async fn get_key(&self, key: &str) -> Option<Value> {
        let conn = self.conn.as_ref()?;
        let mut conn = conn.clone();
        let raw: Option<String> = conn.get(key).await.ok().flatten();
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    /// Delete a key, ignoring errors. Used to clear stale worktree results.
    pub async fn delete_key(&self, key: &str) {
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            let _: Result<(), _> = conn.del(key).await;
        }
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, String)]) {
        let Some(conn) = &self.conn else {
            return;
        };
        let mut conn = conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(*key).arg(value);
        }
        if let Err(e) = cmd.query_async::<()>(&mut conn).await {
            tracing::warn!("Failed to publish event to {stream}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names() {
        let id = Uuid::nil();
        assert_eq!(
            run_stream(id),
            "djinnbot:events:run:00000000-0000-0000-0000-000000000000"
        );
        assert!(workspace_result_key("chieko", id).starts_with("djinnbot:workspace:chieko:"));
    }

    #[tokio::test]
    async fn disabled_service_swallows_publishes() {
        let events = EventService::disabled();
        events
            .publish_global("TASK_CREATED", json!({"taskId": "t1"}))
            .await;
        events.publish_new_run(Uuid::new_v4(), "plan").await;
        assert!(events.run_log(Uuid::new_v4()).await.is_empty());
        assert!(events.get_key("djinnbot:workspace:x:y").await.is_none());
    }
}
