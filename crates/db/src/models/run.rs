use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Executor, FromRow, PgPool, Postgres, types::Json};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

use super::project::WorkspaceType;

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display,
    Default,
)]
#[sqlx(type_name = "run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

/// One execution of a pipeline. Owned by the dispatcher; workers only read.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_id: String,
    pub project_id: Option<Uuid>,
    pub task_description: String,
    pub status: RunStatus,
    pub current_step_id: Option<String>,
    #[ts(type = "Record<string, unknown>")]
    pub outputs: Json<Map<String, Value>>,
    pub human_context: Option<String>,
    pub initiated_by_user_id: Option<String>,
    pub model_override: Option<String>,
    pub task_branch: Option<String>,
    pub workspace_type: Option<WorkspaceType>,
    /// Provider key resolution recorded by the engine; opaque to the core.
    #[ts(type = "unknown | null")]
    pub key_resolution: Option<Json<Value>>,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "Date")]
    pub updated_at: DateTime<Utc>,
    #[ts(type = "Date | null")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
pub struct CreateRun {
    pub pipeline_id: String,
    #[serde(alias = "task")]
    pub task_description: String,
    pub project_id: Option<Uuid>,
    #[serde(alias = "context")]
    pub human_context: Option<String>,
    pub initiated_by_user_id: Option<String>,
    pub model_override: Option<String>,
    pub task_branch: Option<String>,
    pub workspace_type: Option<WorkspaceType>,
}

#[derive(Debug, Deserialize, TS)]
pub struct UpdateRun {
    pub status: Option<RunStatus>,
    #[ts(type = "Record<string, unknown> | null")]
    pub outputs: Option<Map<String, Value>>,
    pub current_step_id: Option<String>,
    pub human_context: Option<String>,
    pub model_override: Option<String>,
    #[ts(type = "unknown | null")]
    pub key_resolution: Option<Value>,
}

const RUN_COLUMNS: &str = "id, pipeline_id, project_id, task_description, status, current_step_id, \
     outputs, human_context, initiated_by_user_id, model_override, task_branch, workspace_type, \
     key_resolution, created_at, updated_at, completed_at";

impl Run {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Run>(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_all(
        pool: &PgPool,
        pipeline_id: Option<&str>,
        status: Option<RunStatus>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Run>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE ($1::text IS NULL OR pipeline_id = $1)
               AND ($2::run_status IS NULL OR status = $2)
             ORDER BY created_at DESC"
        ))
        .bind(pipeline_id)
        .bind(status)
        .fetch_all(pool)
        .await
    }

    pub async fn create<'e, E>(
        executor: E,
        run_id: Uuid,
        data: &CreateRun,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, Run>(&format!(
            "INSERT INTO runs (id, pipeline_id, project_id, task_description, human_context,
                               initiated_by_user_id, model_override, task_branch, workspace_type)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .bind(&data.pipeline_id)
        .bind(data.project_id)
        .bind(&data.task_description)
        .bind(&data.human_context)
        .bind(&data.initiated_by_user_id)
        .bind(&data.model_override)
        .bind(&data.task_branch)
        .bind(data.workspace_type)
        .fetch_one(executor)
        .await
    }

    pub async fn update(pool: &PgPool, id: Uuid, data: &UpdateRun) -> Result<Self, sqlx::Error> {
        let existing = Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let status = data.status.unwrap_or(existing.status);
        let outputs = data.outputs.clone().unwrap_or(existing.outputs.0);
        let current_step_id = data.current_step_id.clone().or(existing.current_step_id);
        let human_context = data.human_context.clone().or(existing.human_context);
        let model_override = data.model_override.clone().or(existing.model_override);
        let key_resolution = data
            .key_resolution
            .clone()
            .map(Json)
            .or(existing.key_resolution);

        sqlx::query_as::<_, Run>(&format!(
            "UPDATE runs
             SET status = $2, outputs = $3, current_step_id = $4, human_context = $5,
                 model_override = $6, key_resolution = $7, updated_at = NOW()
             WHERE id = $1
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(id)
        .bind(status)
        .bind(Json(outputs))
        .bind(current_step_id)
        .bind(human_context)
        .bind(model_override)
        .bind(key_resolution)
        .fetch_one(pool)
        .await
    }

    pub async fn set_status<'e, E>(
        executor: E,
        id: Uuid,
        status: RunStatus,
        completed: bool,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            "UPDATE runs
             SET status = $2, updated_at = NOW(),
                 completed_at = CASE WHEN $3 THEN NOW() ELSE NULL END
             WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(completed)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Live count of running rows; published with run lifecycle events so the
    /// dashboard counter stays current.
    pub async fn count_running(pool: &PgPool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM runs WHERE status = 'running'")
            .fetch_one(pool)
            .await
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM runs WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
