use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Executor, FromRow, PgPool, Postgres, types::Json};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display,
    Default,
)]
#[sqlx(type_name = "step_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

/// One agent turn within a run. Exactly one row per (run_id, step_id);
/// retries reset the row in place and bump retry_count.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub agent_id: String,
    pub status: StepStatus,
    pub session_id: Option<String>,
    #[ts(type = "Record<string, unknown>")]
    pub inputs: Json<Map<String, Value>>,
    #[ts(type = "Record<string, unknown>")]
    pub outputs: Json<Map<String, Value>>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub human_context: Option<String>,
    pub model_used: Option<String>,
    #[ts(type = "Date | null")]
    pub started_at: Option<DateTime<Utc>>,
    #[ts(type = "Date | null")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateStep {
    pub id: Uuid,
    pub step_id: String,
    pub agent_id: String,
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub inputs: Map<String, Value>,
    pub human_context: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

fn default_max_retries() -> i32 {
    3
}

#[derive(Debug, Deserialize, TS)]
pub struct UpdateStep {
    pub status: Option<StepStatus>,
    pub session_id: Option<String>,
    #[ts(type = "Record<string, unknown> | null")]
    pub inputs: Option<Map<String, Value>>,
    #[ts(type = "Record<string, unknown> | null")]
    pub outputs: Option<Map<String, Value>>,
    pub error: Option<String>,
    pub retry_count: Option<i32>,
    #[ts(type = "Date | null")]
    pub started_at: Option<DateTime<Utc>>,
    #[ts(type = "Date | null")]
    pub completed_at: Option<DateTime<Utc>>,
    pub human_context: Option<String>,
    pub model_used: Option<String>,
}

const STEP_COLUMNS: &str = "id, run_id, step_id, agent_id, status, session_id, inputs, outputs, \
     error, retry_count, max_retries, human_context, model_used, started_at, completed_at";

impl Step {
    pub async fn find(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Step>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = $1 AND step_id = $2"
        ))
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_run(
        pool: &PgPool,
        run_id: Uuid,
        status: Option<StepStatus>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Step>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps
             WHERE run_id = $1 AND ($2::step_status IS NULL OR status = $2)
             ORDER BY started_at ASC NULLS LAST"
        ))
        .bind(run_id)
        .bind(status)
        .fetch_all(pool)
        .await
    }

    /// Upsert by (run_id, step_id). An existing row is reset for retry:
    /// status back to pending, retry_count incremented, outputs and error
    /// cleared, inputs overwritten. Fresh rows start at retry_count 0.
    pub async fn upsert(pool: &PgPool, run_id: Uuid, data: &CreateStep) -> Result<Self, sqlx::Error> {
        if let Some(existing) = Self::find(pool, run_id, &data.step_id).await? {
            return sqlx::query_as::<_, Step>(&format!(
                "UPDATE steps
                 SET status = 'pending', retry_count = retry_count + 1, error = NULL,
                     outputs = '{{}}', started_at = NULL, completed_at = NULL,
                     human_context = $3, inputs = $4, agent_id = $5, max_retries = $6
                 WHERE id = $1 AND run_id = $2
                 RETURNING {STEP_COLUMNS}"
            ))
            .bind(existing.id)
            .bind(run_id)
            .bind(&data.human_context)
            .bind(Json(data.inputs.clone()))
            .bind(&data.agent_id)
            .bind(data.max_retries)
            .fetch_one(pool)
            .await;
        }

        sqlx::query_as::<_, Step>(&format!(
            "INSERT INTO steps (id, run_id, step_id, agent_id, inputs, human_context, max_retries)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {STEP_COLUMNS}"
        ))
        .bind(data.id)
        .bind(run_id)
        .bind(&data.step_id)
        .bind(&data.agent_id)
        .bind(Json(data.inputs.clone()))
        .bind(&data.human_context)
        .bind(data.max_retries)
        .fetch_one(pool)
        .await
    }

    pub async fn update(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
        data: &UpdateStep,
    ) -> Result<Self, sqlx::Error> {
        let existing = Self::find(pool, run_id, step_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let status = data.status.unwrap_or(existing.status);
        let session_id = data.session_id.clone().or(existing.session_id);
        let inputs = data.inputs.clone().unwrap_or(existing.inputs.0);
        let outputs = data.outputs.clone().unwrap_or(existing.outputs.0);
        let error = data.error.clone().or(existing.error);
        let retry_count = data.retry_count.unwrap_or(existing.retry_count);
        let started_at = data.started_at.or(existing.started_at);
        let completed_at = data.completed_at.or(existing.completed_at);
        let human_context = data.human_context.clone().or(existing.human_context);
        let model_used = data.model_used.clone().or(existing.model_used);

        sqlx::query_as::<_, Step>(&format!(
            "UPDATE steps
             SET status = $3, session_id = $4, inputs = $5, outputs = $6, error = $7,
                 retry_count = $8, started_at = $9, completed_at = $10, human_context = $11,
                 model_used = $12
             WHERE run_id = $1 AND step_id = $2
             RETURNING {STEP_COLUMNS}"
        ))
        .bind(run_id)
        .bind(step_id)
        .bind(status)
        .bind(session_id)
        .bind(Json(inputs))
        .bind(Json(outputs))
        .bind(error)
        .bind(retry_count)
        .bind(started_at)
        .bind(completed_at)
        .bind(human_context)
        .bind(model_used)
        .fetch_one(pool)
        .await
    }

    /// Reset a single step to pending for a human-requested restart.
    pub async fn reset<'e, E>(
        executor: E,
        run_id: Uuid,
        step_id: &str,
        human_context: Option<&str>,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            "UPDATE steps
             SET status = 'pending', retry_count = 0, error = NULL, started_at = NULL,
                 completed_at = NULL, human_context = $3
             WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(human_context)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reset every step of a run for a full restart.
    pub async fn reset_all<'e, E>(
        executor: E,
        run_id: Uuid,
        human_context: Option<&str>,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            "UPDATE steps
             SET status = 'pending', retry_count = 0, error = NULL, outputs = '{}',
                 started_at = NULL, completed_at = NULL, human_context = $2
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(human_context)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}
