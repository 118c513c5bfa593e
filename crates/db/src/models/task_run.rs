use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, PgPool, Postgres};
use ts_rs::TS;
use uuid::Uuid;

/// History record linking a task to each run it spawned. The Task↔Run
/// back-pointer pair is rebuildable from this table if ever lost.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub status: String,
    #[ts(type = "Date")]
    pub started_at: DateTime<Utc>,
    #[ts(type = "Date | null")]
    pub completed_at: Option<DateTime<Utc>>,
}

const TASK_RUN_COLUMNS: &str = "id, task_id, run_id, pipeline_id, status, started_at, completed_at";

impl TaskRun {
    pub async fn create<'e, E>(
        executor: E,
        task_id: Uuid,
        run_id: Uuid,
        pipeline_id: &str,
        status: &str,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, TaskRun>(&format!(
            "INSERT INTO task_runs (id, task_id, run_id, pipeline_id, status)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {TASK_RUN_COLUMNS}"
        ))
        .bind(id)
        .bind(task_id)
        .bind(run_id)
        .bind(pipeline_id)
        .bind(status)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, TaskRun>(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE task_id = $1 ORDER BY started_at DESC"
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    /// Stamp the history row when the linked run terminates.
    pub async fn complete<'e, E>(
        executor: E,
        task_id: Uuid,
        run_id: Uuid,
        status: &str,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            "UPDATE task_runs SET status = $3, completed_at = NOW()
             WHERE task_id = $1 AND run_id = $2",
        )
        .bind(task_id)
        .bind(run_id)
        .bind(status)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}
