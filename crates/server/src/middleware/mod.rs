use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use db::models::{project::Project, task::Task};
use uuid::Uuid;

use crate::Deployment;

#[derive(Debug, serde::Deserialize)]
pub struct ProjectPathParams {
    pub project_id: Uuid,
}

#[derive(Debug, serde::Deserialize)]
pub struct TaskPathParams {
    pub project_id: Uuid,
    pub task_id: Uuid,
}

pub async fn load_project_middleware(
    State(deployment): State<Deployment>,
    Path(params): Path<ProjectPathParams>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let project = match Project::find_by_id(&deployment.db().pool, params.project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            tracing::warn!("Project {} not found", params.project_id);
            return Err(StatusCode::NOT_FOUND);
        }
        Err(e) => {
            tracing::error!("Failed to fetch project {}: {}", params.project_id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut request = request;
    request.extensions_mut().insert(project);
    Ok(next.run(request).await)
}

/// Loads the task and validates it belongs to the project from the path.
pub async fn load_task_middleware(
    State(deployment): State<Deployment>,
    Path(params): Path<TaskPathParams>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let task =
        match Task::find_in_project(&deployment.db().pool, params.project_id, params.task_id).await
        {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!(
                    "Task {} not found in project {}",
                    params.task_id,
                    params.project_id
                );
                return Err(StatusCode::NOT_FOUND);
            }
            Err(e) => {
                tracing::error!("Failed to fetch task {}: {}", params.task_id, e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

    let mut request = request;
    request.extensions_mut().insert(task);
    Ok(next.run(request).await)
}
