use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Executor, FromRow, PgConnection, PgPool, Postgres, types::Json};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, TS,
    EnumString, Display, Default,
)]
#[sqlx(type_name = "task_priority")]
pub enum TaskPriority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

/// A dated note recorded on a status transition.
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq)]
pub struct TransitionNote {
    pub from: String,
    pub to: String,
    pub note: String,
    pub timestamp: i64,
}

/// Free-form task metadata with the keys the engines rely on typed out.
/// Unknown keys survive round-trips through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS, PartialEq)]
pub struct TaskMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_block_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_block_column_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transition_notes: Vec<TransitionNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(flatten)]
    #[ts(skip)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    /// Raw status name; valid values are defined by the project's columns.
    pub status: String,
    pub priority: TaskPriority,
    pub assigned_agent: Option<String>,
    pub workflow_id: Option<String>,
    pub pipeline_id: Option<String>,
    /// Weak reference to the currently executing run; cleared on completion.
    pub run_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    #[ts(type = "Array<string>")]
    pub tags: Json<Vec<String>>,
    pub estimated_hours: Option<f64>,
    pub column_id: Uuid,
    pub column_position: i32,
    #[ts(type = "TaskMetadata")]
    pub task_metadata: Json<TaskMetadata>,
    pub work_type: Option<String>,
    #[ts(type = "Array<string>")]
    pub completed_stages: Json<Vec<String>>,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "Date")]
    pub updated_at: DateTime<Utc>,
    #[ts(type = "Date | null")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    pub assigned_agent: Option<String>,
    pub workflow_id: Option<String>,
    pub parent_task_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub estimated_hours: Option<f64>,
    pub column_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub work_type: Option<String>,
}

#[derive(Debug, Deserialize, TS)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<TaskPriority>,
    pub assigned_agent: Option<String>,
    pub workflow_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub estimated_hours: Option<f64>,
}

/// Lightweight reference used when attaching related tasks to a response
/// (downstream dependents, subtasks).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct TaskRef {
    pub id: Uuid,
    pub title: String,
    pub status: String,
}

const TASK_COLUMNS: &str = "id, project_id, title, description, status, priority, assigned_agent, \
     workflow_id, pipeline_id, run_id, parent_task_id, tags, estimated_hours, column_id, \
     column_position, task_metadata, work_type, completed_stages, created_at, updated_at, \
     completed_at";

impl Task {
    pub fn metadata(&self) -> &TaskMetadata {
        &self.task_metadata.0
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_in_project(
        pool: &PgPool,
        project_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND project_id = $2"
        ))
        .bind(id)
        .bind(project_id)
        .fetch_optional(pool)
        .await
    }

    /// Fetch with a row-level write lock so concurrent claim requests are
    /// serialized by the database. Must run inside a transaction.
    pub async fn find_in_project_for_update(
        conn: &mut PgConnection,
        project_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND project_id = $2 FOR UPDATE"
        ))
        .bind(id)
        .bind(project_id)
        .fetch_optional(conn)
        .await
    }

    pub async fn find_by_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = $1 ORDER BY column_position"
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_statuses(
        pool: &PgPool,
        project_id: Uuid,
        statuses: &[String],
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE project_id = $1 AND status = ANY($2)
             ORDER BY priority, column_position"
        ))
        .bind(project_id)
        .bind(statuses)
        .fetch_all(pool)
        .await
    }

    /// Ids of tasks referenced as `parent_task_id` by some other task in the
    /// project. These are container parents: derived status, never executed.
    pub async fn container_parent_ids(
        pool: &PgPool,
        project_id: Uuid,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT parent_task_id FROM tasks
             WHERE project_id = $1 AND parent_task_id IS NOT NULL",
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_subtasks(pool: &PgPool, parent_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_task_id = $1 ORDER BY column_position"
        ))
        .bind(parent_id)
        .fetch_all(pool)
        .await
    }

    pub async fn sibling_statuses(
        pool: &PgPool,
        parent_id: Uuid,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT status FROM tasks WHERE parent_task_id = $1")
            .bind(parent_id)
            .fetch_all(pool)
            .await
    }

    /// Agents with at least one in-progress task in the project.
    pub async fn busy_agents(
        pool: &PgPool,
        project_id: Uuid,
        in_progress_statuses: &[String],
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT assigned_agent FROM tasks
             WHERE project_id = $1 AND status = ANY($2) AND assigned_agent IS NOT NULL",
        )
        .bind(project_id)
        .bind(in_progress_statuses)
        .fetch_all(pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create<'e, E>(
        executor: E,
        project_id: Uuid,
        task_id: Uuid,
        data: &CreateTask,
        status: &str,
        column_id: Uuid,
        column_position: i32,
        pipeline_id: Option<String>,
        work_type: Option<String>,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let metadata = TaskMetadata {
            extra: data.metadata.clone(),
            ..Default::default()
        };
        sqlx::query_as::<_, Task>(&format!(
            "INSERT INTO tasks (id, project_id, title, description, status, priority,
                                assigned_agent, workflow_id, pipeline_id, parent_task_id, tags,
                                estimated_hours, column_id, column_position, task_metadata,
                                work_type, completed_stages)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, '[]')
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id)
        .bind(project_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(status)
        .bind(data.priority)
        .bind(&data.assigned_agent)
        .bind(&data.workflow_id)
        .bind(pipeline_id)
        .bind(data.parent_task_id)
        .bind(Json(data.tags.clone()))
        .bind(data.estimated_hours)
        .bind(column_id)
        .bind(column_position)
        .bind(Json(metadata))
        .bind(work_type)
        .fetch_one(executor)
        .await
    }

    pub async fn update_fields(
        pool: &PgPool,
        id: Uuid,
        data: &UpdateTask,
    ) -> Result<Self, sqlx::Error> {
        let existing = Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let title = data.title.clone().unwrap_or(existing.title);
        let description = data.description.clone().unwrap_or(existing.description);
        let priority = data.priority.unwrap_or(existing.priority);
        let assigned_agent = data.assigned_agent.clone().or(existing.assigned_agent);
        let workflow_id = data.workflow_id.clone().or(existing.workflow_id);
        let tags = data.tags.clone().unwrap_or(existing.tags.0);
        let estimated_hours = data.estimated_hours.or(existing.estimated_hours);

        sqlx::query_as::<_, Task>(&format!(
            "UPDATE tasks
             SET title = $2, description = $3, priority = $4, assigned_agent = $5,
                 workflow_id = $6, tags = $7, estimated_hours = $8, updated_at = NOW()
             WHERE id = $1
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(title)
        .bind(description)
        .bind(priority)
        .bind(assigned_agent)
        .bind(workflow_id)
        .bind(Json(tags))
        .bind(estimated_hours)
        .fetch_one(pool)
        .await
    }

    /// Move a task to a new status/column pair, stamping `completed_at` when
    /// the status is terminal-done for its project.
    pub async fn apply_transition<'e, E>(
        executor: E,
        id: Uuid,
        status: &str,
        column_id: Uuid,
        completed: bool,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            "UPDATE tasks
             SET status = $2, column_id = $3, updated_at = NOW(),
                 completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
             WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(column_id)
        .bind(completed)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn set_assigned_agent<'e, E>(
        executor: E,
        id: Uuid,
        agent_id: &str,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query("UPDATE tasks SET assigned_agent = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(agent_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn set_metadata<'e, E>(
        executor: E,
        id: Uuid,
        metadata: &TaskMetadata,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query("UPDATE tasks SET task_metadata = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(Json(metadata.clone()))
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn set_completed_stages(
        pool: &PgPool,
        id: Uuid,
        stages: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET completed_stages = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(Json(stages.to_vec()))
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn move_to_column(
        pool: &PgPool,
        id: Uuid,
        column_id: Uuid,
        position: i32,
        status: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks
             SET column_id = $2, column_position = $3, status = $4, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(column_id)
        .bind(position)
        .bind(status)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Link a run to the task and move it into execution.
    pub async fn start_run<'e, E>(
        executor: E,
        id: Uuid,
        run_id: Uuid,
        pipeline_id: &str,
        status: &str,
        column_id: Option<Uuid>,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            "UPDATE tasks
             SET run_id = $2, pipeline_id = $3, status = $4,
                 column_id = COALESCE($5, column_id), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(run_id)
        .bind(pipeline_id)
        .bind(status)
        .bind(column_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Clear the run back-pointer and settle the task after run completion.
    pub async fn finish_run<'e, E>(
        executor: E,
        id: Uuid,
        status: &str,
        column_id: Option<Uuid>,
        completed: bool,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            "UPDATE tasks
             SET run_id = NULL, status = $2, column_id = COALESCE($3, column_id),
                 updated_at = NOW(),
                 completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
             WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(column_id)
        .bind(completed)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn max_column_position(pool: &PgPool, column_id: Uuid) -> Result<i32, sqlx::Error> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT MAX(column_position) FROM tasks WHERE column_id = $1")
                .bind(column_id)
                .fetch_one(pool)
                .await?;
        Ok(max.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_p0_first() {
        assert!(TaskPriority::P0 < TaskPriority::P1);
        assert!(TaskPriority::P2 < TaskPriority::P3);
        assert_eq!(TaskPriority::default(), TaskPriority::P2);
    }

    #[test]
    fn metadata_round_trips_unknown_keys() {
        let raw = serde_json::json!({
            "git_branch": "feat/x",
            "custom_key": {"nested": true}
        });
        let meta: TaskMetadata = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(meta.git_branch.as_deref(), Some("feat/x"));
        assert!(meta.extra.contains_key("custom_key"));
        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["custom_key"], raw["custom_key"]);
    }

    #[test]
    fn metadata_pre_block_fields_pop_cleanly() {
        let mut meta = TaskMetadata {
            pre_block_status: Some("ready".into()),
            pre_block_column_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let restored = meta.pre_block_status.take();
        meta.pre_block_column_id = None;
        assert_eq!(restored.as_deref(), Some("ready"));
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("pre_block_status").is_none());
        assert!(json.get("pre_block_column_id").is_none());
    }
}
