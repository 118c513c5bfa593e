use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use ts_rs::TS;
use uuid::Uuid;

/// Key/value pairs written by steps and visible to later steps of the same
/// run. Upsert on (run_id, key).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Output {
    pub run_id: Uuid,
    pub step_id: String,
    pub key: String,
    pub value: String,
}

impl Output {
    pub async fn find_by_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Output>(
            "SELECT run_id, step_id, key, value FROM outputs WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await
    }

    pub async fn upsert(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
        key: &str,
        value: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Output>(
            "INSERT INTO outputs (run_id, step_id, key, value)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (run_id, key)
             DO UPDATE SET value = EXCLUDED.value, step_id = EXCLUDED.step_id
             RETURNING run_id, step_id, key, value",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(key)
        .bind(value)
        .fetch_one(pool)
        .await
    }
}
