use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, PgPool, Postgres};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

use super::task::TaskRef;

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display,
    Default,
)]
#[sqlx(type_name = "dependency_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DependencyType {
    /// from_task must reach terminal-done before to_task can start.
    #[default]
    Blocks,
    /// Soft relation for context only; never gates readiness.
    Informs,
}

/// A directed relation between two tasks of the same project.
/// The `blocks` sub-graph is kept acyclic by cycle detection on insert.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct DependencyEdge {
    pub id: Uuid,
    pub project_id: Uuid,
    pub from_task_id: Uuid,
    pub to_task_id: Uuid,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub edge_type: DependencyType,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateDependencyEdge {
    #[serde(alias = "fromTaskId")]
    pub from_task_id: Uuid,
    #[serde(rename = "type", default)]
    pub edge_type: DependencyType,
}

/// A blocking predecessor together with its current status, used by the
/// readiness checks.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlockingPredecessor {
    pub from_task_id: Uuid,
    pub status: String,
}

const EDGE_COLUMNS: &str = "id, project_id, from_task_id, to_task_id, type";

impl DependencyEdge {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, DependencyEdge>(&format!(
            "SELECT {EDGE_COLUMNS} FROM dependency_edges WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_project(
        pool: &PgPool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, DependencyEdge>(&format!(
            "SELECT {EDGE_COLUMNS} FROM dependency_edges WHERE project_id = $1"
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn exists(
        pool: &PgPool,
        from_task_id: Uuid,
        to_task_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM dependency_edges WHERE from_task_id = $1 AND to_task_id = $2)",
        )
        .bind(from_task_id)
        .bind(to_task_id)
        .fetch_one(pool)
        .await
    }

    pub async fn create<'e, E>(
        executor: E,
        project_id: Uuid,
        from_task_id: Uuid,
        to_task_id: Uuid,
        edge_type: DependencyType,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, DependencyEdge>(&format!(
            "INSERT INTO dependency_edges (id, project_id, from_task_id, to_task_id, type)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {EDGE_COLUMNS}"
        ))
        .bind(id)
        .bind(project_id)
        .bind(from_task_id)
        .bind(to_task_id)
        .bind(edge_type)
        .fetch_one(executor)
        .await
    }

    /// Idempotent delete.
    pub async fn delete(pool: &PgPool, project_id: Uuid, id: Uuid) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM dependency_edges WHERE id = $1 AND project_id = $2")
                .bind(id)
                .bind(project_id)
                .execute(pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Statuses of all `blocks` predecessors of a task.
    pub async fn blocking_predecessors(
        pool: &PgPool,
        to_task_id: Uuid,
    ) -> Result<Vec<BlockingPredecessor>, sqlx::Error> {
        sqlx::query_as::<_, BlockingPredecessor>(
            "SELECT e.from_task_id, t.status
             FROM dependency_edges e
             JOIN tasks t ON t.id = e.from_task_id
             WHERE e.to_task_id = $1 AND e.type = 'blocks'",
        )
        .bind(to_task_id)
        .fetch_all(pool)
        .await
    }

    /// Ids of tasks directly blocked by the given task.
    pub async fn blocked_dependent_ids(
        pool: &PgPool,
        project_id: Uuid,
        from_task_id: Uuid,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT to_task_id FROM dependency_edges
             WHERE from_task_id = $1 AND project_id = $2 AND type = 'blocks'",
        )
        .bind(from_task_id)
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    /// Downstream tasks this one blocks, with titles and statuses. Agents use
    /// this to avoid picking up work whose downstream would conflict.
    pub async fn downstream_refs(
        pool: &PgPool,
        from_task_id: Uuid,
    ) -> Result<Vec<TaskRef>, sqlx::Error> {
        sqlx::query_as::<_, TaskRef>(
            "SELECT t.id, t.title, t.status
             FROM dependency_edges e
             JOIN tasks t ON t.id = e.to_task_id
             WHERE e.from_task_id = $1 AND e.type = 'blocks'",
        )
        .bind(from_task_id)
        .fetch_all(pool)
        .await
    }

    /// Upstream tasks this one depends on, with titles and statuses.
    pub async fn upstream_refs(
        pool: &PgPool,
        to_task_id: Uuid,
    ) -> Result<Vec<TaskRef>, sqlx::Error> {
        sqlx::query_as::<_, TaskRef>(
            "SELECT t.id, t.title, t.status
             FROM dependency_edges e
             JOIN tasks t ON t.id = e.from_task_id
             WHERE e.to_task_id = $1",
        )
        .bind(to_task_id)
        .fetch_all(pool)
        .await
    }
}
