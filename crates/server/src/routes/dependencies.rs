use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, post},
};
use utils::response::ApiResponse;
use uuid::Uuid;

use db::models::{
    dependency_edge::{CreateDependencyEdge, DependencyEdge},
    project::Project,
    task::Task,
};
use services::services::graph::{self, GraphSnapshot};

use crate::{
    Deployment,
    error::ApiError,
    middleware::{load_project_middleware, load_task_middleware},
};

/// Add a dependency: `from_task_id` must complete before the path task can
/// start. Every insert goes through cycle detection.
pub async fn add_dependency(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Json(payload): Json<CreateDependencyEdge>,
) -> Result<ResponseJson<ApiResponse<DependencyEdge>>, ApiError> {
    let pool = &deployment.db().pool;

    if payload.from_task_id == task.id {
        return Err(ApiError::BadRequest(
            "A task cannot depend on itself".to_string(),
        ));
    }

    let from_task = Task::find_in_project(pool, project.id, payload.from_task_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest("Prerequisite task not found".to_string()))?;

    if DependencyEdge::exists(pool, payload.from_task_id, task.id).await? {
        return Err(ApiError::BadRequest("Dependency already exists".to_string()));
    }

    let existing: Vec<(Uuid, Uuid)> = DependencyEdge::find_by_project(pool, project.id)
        .await?
        .into_iter()
        .map(|e| (e.from_task_id, e.to_task_id))
        .collect();
    if let Some(cycle) = graph::detect_cycle(&existing, payload.from_task_id, task.id) {
        let mut titles = Vec::with_capacity(cycle.len());
        for id in &cycle {
            let title = Task::find_by_id(pool, *id)
                .await?
                .map(|t| t.title)
                .unwrap_or_else(|| id.to_string());
            titles.push(title);
        }
        return Err(ApiError::BadRequest(format!(
            "Cannot add dependency: would create a cycle: {}",
            titles.join(" → ")
        )));
    }

    let edge = DependencyEdge::create(
        pool,
        project.id,
        payload.from_task_id,
        task.id,
        payload.edge_type,
    )
    .await?;

    deployment
        .events()
        .publish_global(
            "DEPENDENCY_ADDED",
            serde_json::json!({
                "projectId": project.id,
                "fromTaskId": from_task.id,
                "toTaskId": task.id,
                "type": payload.edge_type.to_string(),
            }),
        )
        .await;

    Ok(ResponseJson(ApiResponse::success(edge)))
}

/// Remove a dependency. Idempotent.
pub async fn remove_dependency(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Path((_, _, dep_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    DependencyEdge::delete(&deployment.db().pool, project.id, dep_id).await?;
    deployment
        .events()
        .publish_global(
            "DEPENDENCY_REMOVED",
            serde_json::json!({ "projectId": project.id, "dependencyId": dep_id }),
        )
        .await;
    Ok(ResponseJson(ApiResponse::success(())))
}

/// Full dependency graph with critical path and topological order.
pub async fn get_dependency_graph(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<GraphSnapshot>>, ApiError> {
    let snapshot = graph::snapshot(&deployment.db().pool, project.id).await?;
    Ok(ResponseJson(ApiResponse::success(snapshot)))
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let dep_router = Router::new()
        .route("/", post(add_dependency))
        .route("/{dep_id}", axum::routing::delete(remove_dependency))
        .layer(from_fn_with_state(deployment.clone(), load_task_middleware))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    let graph_router = Router::new()
        .route("/", get(get_dependency_graph))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    Router::new()
        .nest(
            "/projects/{project_id}/tasks/{task_id}/dependencies",
            dep_router,
        )
        .nest("/projects/{project_id}/dependency-graph", graph_router)
}
