use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, PgPool, Postgres, types::Json};
use ts_rs::TS;
use uuid::Uuid;

/// An ordered visual bucket that groups tasks by one or more raw statuses.
/// A task whose status appears in several columns maps to the lowest-position
/// column containing it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct KanbanColumn {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub position: i32,
    pub wip_limit: Option<i32>,
    /// Ordered raw status names mapped to this column; the first entry is the
    /// status a task takes when dropped into the column.
    #[ts(type = "Array<string>")]
    pub task_statuses: Json<Vec<String>>,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "Date")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateKanbanColumn {
    pub name: String,
    pub position: Option<i32>,
    pub wip_limit: Option<i32>,
    #[serde(default)]
    pub task_statuses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct UpdateKanbanColumn {
    pub name: Option<String>,
    pub position: Option<i32>,
    pub wip_limit: Option<i32>,
    pub task_statuses: Option<Vec<String>>,
}

const COLUMN_COLUMNS: &str =
    "id, project_id, name, position, wip_limit, task_statuses, created_at, updated_at";

impl KanbanColumn {
    pub fn statuses(&self) -> &[String] {
        &self.task_statuses.0
    }

    pub fn entry_status(&self) -> Option<&str> {
        self.task_statuses.0.first().map(String::as_str)
    }

    pub fn maps_status(&self, status: &str) -> bool {
        self.task_statuses.0.iter().any(|s| s == status)
    }

    /// Find all columns for a project, ordered by position
    pub async fn find_by_project(
        pool: &PgPool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, KanbanColumn>(&format!(
            "SELECT {COLUMN_COLUMNS} FROM kanban_columns WHERE project_id = $1 ORDER BY position ASC"
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, KanbanColumn>(&format!(
            "SELECT {COLUMN_COLUMNS} FROM kanban_columns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Resolve the column a raw status maps to: the lowest-position column
    /// whose `task_statuses` contains it.
    pub async fn find_for_status(
        pool: &PgPool,
        project_id: Uuid,
        status: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        let columns = Self::find_by_project(pool, project_id).await?;
        Ok(columns.into_iter().find(|c| c.maps_status(status)))
    }

    /// Union of all raw statuses across a project's columns. This is the set
    /// of valid transition targets; statuses are column-defined, never a
    /// hardcoded list.
    pub async fn valid_statuses(
        pool: &PgPool,
        project_id: Uuid,
    ) -> Result<Vec<String>, sqlx::Error> {
        let columns = Self::find_by_project(pool, project_id).await?;
        let mut statuses: Vec<String> = Vec::new();
        for col in &columns {
            for s in col.statuses() {
                if !statuses.contains(s) {
                    statuses.push(s.clone());
                }
            }
        }
        Ok(statuses)
    }

    pub async fn create<'e, E>(
        executor: E,
        project_id: Uuid,
        data: &CreateKanbanColumn,
        position: i32,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, KanbanColumn>(&format!(
            "INSERT INTO kanban_columns (id, project_id, name, position, wip_limit, task_statuses)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {COLUMN_COLUMNS}"
        ))
        .bind(id)
        .bind(project_id)
        .bind(&data.name)
        .bind(position)
        .bind(data.wip_limit)
        .bind(Json(data.task_statuses.clone()))
        .fetch_one(executor)
        .await
    }

    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        data: &UpdateKanbanColumn,
    ) -> Result<Self, sqlx::Error> {
        let existing = Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let name = data.name.clone().unwrap_or(existing.name);
        let position = data.position.unwrap_or(existing.position);
        let wip_limit = data.wip_limit.or(existing.wip_limit);
        let task_statuses = data
            .task_statuses
            .clone()
            .unwrap_or(existing.task_statuses.0);

        sqlx::query_as::<_, KanbanColumn>(&format!(
            "UPDATE kanban_columns
             SET name = $2, position = $3, wip_limit = $4, task_statuses = $5, updated_at = NOW()
             WHERE id = $1
             RETURNING {COLUMN_COLUMNS}"
        ))
        .bind(id)
        .bind(name)
        .bind(position)
        .bind(wip_limit)
        .bind(Json(task_statuses))
        .fetch_one(pool)
        .await
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM kanban_columns WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of tasks currently sitting in this column.
    pub async fn task_count(pool: &PgPool, column_id: Uuid) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks WHERE column_id = $1")
            .bind(column_id)
            .fetch_one(pool)
            .await
    }

    pub async fn max_position(pool: &PgPool, project_id: Uuid) -> Result<i32, sqlx::Error> {
        let max: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(position) FROM kanban_columns WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_one(pool)
        .await?;
        Ok(max.unwrap_or(0))
    }
}
