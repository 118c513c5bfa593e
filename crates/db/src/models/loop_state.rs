use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool, types::Json};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq)]
pub struct LoopItem {
    pub id: String,
    #[ts(type = "unknown")]
    pub value: Value,
    #[serde(default = "default_item_status")]
    pub status: String,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub output: Option<Value>,
}

fn default_item_status() -> String {
    "pending".to_string()
}

/// Per-step item-by-item progress for map-style pipelines.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct LoopState {
    pub run_id: Uuid,
    pub step_id: String,
    #[ts(type = "Array<LoopItem>")]
    pub items: Json<Vec<LoopItem>>,
    pub current_index: i32,
}

/// Scan from `current_index` for the next pending item.
/// Returns the item index, or None when the loop is exhausted.
pub fn next_pending_index(items: &[LoopItem], current_index: usize) -> Option<usize> {
    (current_index..items.len()).find(|&i| items[i].status == "pending")
}

impl LoopState {
    pub async fn find(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, LoopState>(
            "SELECT run_id, step_id, items, current_index FROM loop_states
             WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn upsert(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
        items: &[LoopItem],
        current_index: i32,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, LoopState>(
            "INSERT INTO loop_states (run_id, step_id, items, current_index)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (run_id, step_id)
             DO UPDATE SET items = EXCLUDED.items, current_index = EXCLUDED.current_index
             RETURNING run_id, step_id, items, current_index",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(Json(items.to_vec()))
        .bind(current_index)
        .fetch_one(pool)
        .await
    }

    pub async fn save_items(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
        items: &[LoopItem],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE loop_states SET items = $3 WHERE run_id = $1 AND step_id = $2")
            .bind(run_id)
            .bind(step_id)
            .bind(Json(items.to_vec()))
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_current_index(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
        current_index: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE loop_states SET current_index = $3 WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(current_index)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, status: &str) -> LoopItem {
        LoopItem {
            id: id.to_string(),
            value: json!({"n": id}),
            status: status.to_string(),
            output: None,
        }
    }

    #[test]
    fn advance_finds_next_pending_from_cursor() {
        let items = vec![
            item("a", "completed"),
            item("b", "pending"),
            item("c", "pending"),
        ];
        assert_eq!(next_pending_index(&items, 0), Some(1));
        assert_eq!(next_pending_index(&items, 2), Some(2));
    }

    #[test]
    fn advance_skips_running_and_failed_items() {
        let items = vec![item("a", "running"), item("b", "failed"), item("c", "pending")];
        assert_eq!(next_pending_index(&items, 0), Some(2));
    }

    #[test]
    fn advance_returns_none_when_exhausted() {
        let items = vec![item("a", "completed"), item("b", "failed")];
        assert_eq!(next_pending_index(&items, 0), None);
        assert_eq!(next_pending_index(&[], 0), None);
    }
}
