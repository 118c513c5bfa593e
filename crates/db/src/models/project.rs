use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, PgPool, Postgres, types::Json};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Project not found")]
    ProjectNotFound,
}

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, TS, EnumString, Display,
    Default,
)]
#[sqlx(type_name = "project_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Archived,
}

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, TS, EnumString, Display,
    Default,
)]
#[sqlx(type_name = "workspace_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkspaceType {
    EphemeralRunDir,
    #[default]
    PersistentDirectory,
}

/// Per-project mapping from semantic status roles to raw status names.
///
/// Every engine that needs to reason about what "done" means reads these sets
/// instead of comparing against literal status strings. Projects may rename or
/// add raw statuses freely as long as each role stays populated.
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq)]
pub struct StatusSemantics {
    pub initial: Vec<String>,
    pub claimable: Vec<String>,
    pub terminal_done: Vec<String>,
    pub terminal_fail: Vec<String>,
    pub blocked: Vec<String>,
}

impl Default for StatusSemantics {
    fn default() -> Self {
        Self {
            initial: vec!["backlog".into(), "planning".into()],
            claimable: vec!["backlog".into(), "planning".into(), "ready".into()],
            terminal_done: vec!["done".into()],
            terminal_fail: vec!["failed".into()],
            blocked: vec!["blocked".into()],
        }
    }
}

impl StatusSemantics {
    pub fn is_initial(&self, status: &str) -> bool {
        self.initial.iter().any(|s| s == status)
    }

    pub fn is_claimable(&self, status: &str) -> bool {
        self.claimable.iter().any(|s| s == status)
    }

    pub fn is_done(&self, status: &str) -> bool {
        self.terminal_done.iter().any(|s| s == status)
    }

    pub fn is_fail(&self, status: &str) -> bool {
        self.terminal_fail.iter().any(|s| s == status)
    }

    pub fn is_blocked(&self, status: &str) -> bool {
        self.blocked.iter().any(|s| s == status)
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.is_done(status) || self.is_fail(status)
    }

    pub fn first_initial(&self) -> &str {
        self.initial.first().map(String::as_str).unwrap_or("backlog")
    }

    pub fn first_claimable(&self) -> &str {
        self.claimable.first().map(String::as_str).unwrap_or("ready")
    }

    pub fn first_done(&self) -> &str {
        self.terminal_done.first().map(String::as_str).unwrap_or("done")
    }

    pub fn first_fail(&self) -> &str {
        self.terminal_fail.first().map(String::as_str).unwrap_or("failed")
    }

    pub fn first_blocked(&self) -> &str {
        self.blocked.first().map(String::as_str).unwrap_or("blocked")
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub repository: Option<String>,
    pub default_pipeline_id: Option<String>,
    #[ts(type = "StatusSemantics")]
    pub status_semantics: Json<StatusSemantics>,
    pub workspace_type: WorkspaceType,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "Date")]
    pub updated_at: DateTime<Utc>,
    #[ts(type = "Date | null")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub repository: Option<String>,
    pub workspace_type: Option<WorkspaceType>,
}

#[derive(Debug, Deserialize, TS)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub repository: Option<String>,
    pub default_pipeline_id: Option<String>,
}

const PROJECT_COLUMNS: &str = "id, name, description, status, repository, default_pipeline_id, \
     status_semantics, workspace_type, created_at, updated_at, completed_at";

impl Project {
    pub fn semantics(&self) -> &StatusSemantics {
        &self.status_semantics.0
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_all(
        pool: &PgPool,
        status: Option<ProjectStatus>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        match status {
            Some(status) => {
                sqlx::query_as::<_, Project>(&format!(
                    "SELECT {PROJECT_COLUMNS} FROM projects WHERE status = $1 ORDER BY updated_at DESC"
                ))
                .bind(status)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Project>(&format!(
                    "SELECT {PROJECT_COLUMNS} FROM projects WHERE status <> 'archived' ORDER BY updated_at DESC"
                ))
                .fetch_all(pool)
                .await
            }
        }
    }

    pub async fn create<'e, E>(
        executor: E,
        data: &CreateProject,
        project_id: Uuid,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, Project>(&format!(
            "INSERT INTO projects (id, name, description, repository, status_semantics, workspace_type)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(project_id)
        .bind(&data.name)
        .bind(&data.description)
        .bind(&data.repository)
        .bind(Json(StatusSemantics::default()))
        .bind(data.workspace_type.unwrap_or_default())
        .fetch_one(executor)
        .await
    }

    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        payload: &UpdateProject,
    ) -> Result<Self, sqlx::Error> {
        let existing = Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let name = payload.name.clone().unwrap_or(existing.name);
        let description = payload.description.clone().unwrap_or(existing.description);
        let status = payload.status.unwrap_or(existing.status);
        let repository = payload.repository.clone().or(existing.repository);
        let default_pipeline_id = payload
            .default_pipeline_id
            .clone()
            .or(existing.default_pipeline_id);
        let completed_at = if status == ProjectStatus::Completed {
            existing.completed_at.or(Some(Utc::now()))
        } else {
            existing.completed_at
        };

        sqlx::query_as::<_, Project>(&format!(
            "UPDATE projects
             SET name = $2, description = $3, status = $4, repository = $5,
                 default_pipeline_id = $6, completed_at = $7, updated_at = NOW()
             WHERE id = $1
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(id)
        .bind(name)
        .bind(description)
        .bind(status)
        .bind(repository)
        .bind(default_pipeline_id)
        .bind(completed_at)
        .fetch_one(pool)
        .await
    }

    pub async fn set_status(
        pool: &PgPool,
        id: Uuid,
        status: ProjectStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE projects SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Per-status task counts for the project list view.
    pub async fn task_counts(pool: &PgPool, id: Uuid) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM tasks WHERE project_id = $1 GROUP BY status",
        )
        .bind(id)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_semantics_cover_every_role() {
        let s = StatusSemantics::default();
        assert!(!s.initial.is_empty());
        assert!(!s.claimable.is_empty());
        assert!(!s.terminal_done.is_empty());
        assert!(!s.terminal_fail.is_empty());
        assert!(!s.blocked.is_empty());
    }

    #[test]
    fn semantic_lookups() {
        let s = StatusSemantics::default();
        assert!(s.is_done("done"));
        assert!(!s.is_done("failed"));
        assert!(s.is_fail("failed"));
        assert!(s.is_blocked("blocked"));
        assert!(s.is_claimable("ready"));
        assert!(s.is_claimable("backlog"));
        assert!(!s.is_claimable("in_progress"));
        assert!(s.is_terminal("done") && s.is_terminal("failed"));
        assert!(!s.is_terminal("ready"));
        assert_eq!(s.first_claimable(), "backlog");
        assert_eq!(s.first_done(), "done");
    }
}
