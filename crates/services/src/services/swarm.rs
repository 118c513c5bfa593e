use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use db::{
    DBService,
    models::{
        dependency_edge::{DependencyEdge, DependencyType},
        project::Project,
        task::Task,
    },
};

use crate::services::events::EventService;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("No tasks selected")]
    EmptySelection,
    #[error("Task {0} not found in project")]
    TaskNotFound(Uuid),
    #[error("Task '{title}' is not claimable (status '{status}')")]
    NotClaimable { title: String, status: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SwarmNode {
    pub task_id: Uuid,
    pub title: String,
    pub status: String,
    pub assigned_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SwarmEdge {
    pub from_task_id: Uuid,
    pub to_task_id: Uuid,
}

/// Execution DAG dispatched to the swarm executor. Nodes are tasks, edges
/// are blocking dependencies; the executor fans work to agents respecting
/// the topology.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SwarmDag {
    pub swarm_id: Uuid,
    pub project_id: Uuid,
    pub nodes: Vec<SwarmNode>,
    pub edges: Vec<SwarmEdge>,
}

/// Induce the sub-DAG of the selected tasks: only `blocks` edges with both
/// endpoints selected are kept.
pub fn induced_dag(
    swarm_id: Uuid,
    project_id: Uuid,
    tasks: &[Task],
    edges: &[DependencyEdge],
) -> SwarmDag {
    let nodes: Vec<SwarmNode> = tasks
        .iter()
        .map(|t| SwarmNode {
            task_id: t.id,
            title: t.title.clone(),
            status: t.status.clone(),
            assigned_agent: t.assigned_agent.clone(),
        })
        .collect();
    let selected: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
    let edges: Vec<SwarmEdge> = edges
        .iter()
        .filter(|e| e.edge_type == DependencyType::Blocks)
        .filter(|e| selected.contains(&e.from_task_id) && selected.contains(&e.to_task_id))
        .map(|e| SwarmEdge {
            from_task_id: e.from_task_id,
            to_task_id: e.to_task_id,
        })
        .collect();
    SwarmDag {
        swarm_id,
        project_id,
        nodes,
        edges,
    }
}

/// Coordinates parallel execution across selected tasks, leaving the actual
/// fan-out to the external swarm executor.
#[derive(Clone)]
pub struct SwarmCoordinator {
    db: DBService,
    events: EventService,
}

impl SwarmCoordinator {
    pub fn new(db: DBService, events: EventService) -> Self {
        Self { db, events }
    }

    fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    /// Launch a swarm from board-selected tasks. Every selected task must be
    /// claimable per the project's semantics; the DAG is induced from the
    /// project's existing dependency graph.
    pub async fn board_swarm(
        &self,
        project: &Project,
        task_ids: &[Uuid],
    ) -> Result<SwarmDag, SwarmError> {
        if task_ids.is_empty() {
            return Err(SwarmError::EmptySelection);
        }

        let semantics = project.semantics();
        let mut tasks = Vec::with_capacity(task_ids.len());
        for &task_id in task_ids {
            let task = Task::find_in_project(self.pool(), project.id, task_id)
                .await?
                .ok_or(SwarmError::TaskNotFound(task_id))?;
            if !semantics.is_claimable(&task.status) {
                return Err(SwarmError::NotClaimable {
                    title: task.title,
                    status: task.status,
                });
            }
            tasks.push(task);
        }

        let edges = DependencyEdge::find_by_project(self.pool(), project.id).await?;
        let dag = induced_dag(Uuid::new_v4(), project.id, &tasks, &edges);
        self.dispatch(&dag).await;
        Ok(dag)
    }

    /// Agent-initiated swarms arrive with a pre-built DAG.
    pub async fn dispatch_prebuilt(&self, project_id: Uuid, dag: SwarmDag) -> SwarmDag {
        let dag = SwarmDag { project_id, ..dag };
        self.dispatch(&dag).await;
        dag
    }

    async fn dispatch(&self, dag: &SwarmDag) {
        self.events
            .publish_global(
                "SWARM_DISPATCHED",
                json!({
                    "swarmId": dag.swarm_id,
                    "projectId": dag.project_id,
                    "dag": dag,
                }),
            )
            .await;
        tracing::info!(
            "Swarm {} dispatched: {} tasks, {} edges",
            dag.swarm_id,
            dag.nodes.len(),
            dag.edges.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    fn task(n: u8, title: &str) -> Task {
        Task {
            id: Uuid::from_bytes([n; 16]),
            project_id: Uuid::nil(),
            title: title.to_string(),
            description: String::new(),
            status: "ready".to_string(),
            priority: Default::default(),
            assigned_agent: None,
            workflow_id: None,
            pipeline_id: None,
            run_id: None,
            parent_task_id: None,
            tags: Json(Vec::new()),
            estimated_hours: None,
            column_id: Uuid::nil(),
            column_position: 0,
            task_metadata: Json(Default::default()),
            work_type: None,
            completed_stages: Json(Vec::new()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    fn edge(from: u8, to: u8, edge_type: DependencyType) -> DependencyEdge {
        DependencyEdge {
            id: Uuid::new_v4(),
            project_id: Uuid::nil(),
            from_task_id: Uuid::from_bytes([from; 16]),
            to_task_id: Uuid::from_bytes([to; 16]),
            edge_type,
        }
    }

    #[test]
    fn induced_dag_keeps_only_selected_blocking_edges() {
        let tasks = vec![task(1, "a"), task(2, "b")];
        let edges = vec![
            edge(1, 2, DependencyType::Blocks),
            // Edge to an unselected task is dropped.
            edge(1, 9, DependencyType::Blocks),
            // Informs edges never constrain execution.
            edge(2, 1, DependencyType::Informs),
        ];
        let dag = induced_dag(Uuid::new_v4(), Uuid::nil(), &tasks, &edges);
        assert_eq!(dag.nodes.len(), 2);
        assert_eq!(dag.edges.len(), 1);
        assert_eq!(dag.edges[0].from_task_id, Uuid::from_bytes([1; 16]));
        assert_eq!(dag.edges[0].to_task_id, Uuid::from_bytes([2; 16]));
    }
}
