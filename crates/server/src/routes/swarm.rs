use axum::{
    Extension, Json, Router,
    extract::State,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::post,
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use db::models::project::Project;
use services::services::swarm::SwarmDag;

use crate::{Deployment, error::ApiError, middleware::load_project_middleware};

#[derive(Debug, Deserialize, TS)]
pub struct SwarmExecuteRequest {
    #[serde(alias = "taskIds", default)]
    pub task_ids: Vec<Uuid>,
    /// Agent-initiated swarms pass a pre-built DAG instead of task ids.
    pub dag: Option<SwarmDag>,
}

#[derive(Debug, Serialize, TS)]
pub struct SwarmExecuteResponse {
    pub swarm_id: Uuid,
    pub tasks: usize,
    pub edges: usize,
}

/// Launch a parallel swarm across selected tasks. The dependency graph of
/// the selection determines execution order; the external swarm executor
/// subscribes to SWARM_DISPATCHED and fans work out to agents.
pub async fn swarm_execute(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Json(payload): Json<SwarmExecuteRequest>,
) -> Result<ResponseJson<ApiResponse<SwarmExecuteResponse>>, ApiError> {
    let dag = match payload.dag {
        Some(dag) => {
            deployment
                .swarm()
                .dispatch_prebuilt(project.id, dag)
                .await
        }
        None => {
            deployment
                .swarm()
                .board_swarm(&project, &payload.task_ids)
                .await?
        }
    };

    Ok(ResponseJson(ApiResponse::success(SwarmExecuteResponse {
        swarm_id: dag.swarm_id,
        tasks: dag.nodes.len(),
        edges: dag.edges.len(),
    })))
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let swarm_router = Router::new()
        .route("/", post(swarm_execute))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    Router::new().nest("/projects/{project_id}/swarm-execute", swarm_router)
}
