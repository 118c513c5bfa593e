use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use db::models::{project::Project, task::Task};
use services::services::{
    github::{PrStatus, PullRequestInfo},
    workspace::{WorkspaceError, WorktreeInfo},
};

use crate::{
    Deployment,
    error::ApiError,
    middleware::{load_project_middleware, load_task_middleware},
};

#[derive(Debug, Serialize, TS)]
pub struct TaskBranchResponse {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub branch: String,
}

#[derive(Debug, Deserialize, TS)]
pub struct TaskWorkspaceRequest {
    #[serde(alias = "agentId")]
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoveWorkspaceQuery {
    pub agent_id: String,
}

#[derive(Debug, Deserialize, TS)]
pub struct OpenPullRequestRequest {
    #[serde(alias = "agentId")]
    pub agent_id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub draft: bool,
    pub base_branch: Option<String>,
}

fn require_git(project: &Project) -> Result<(), ApiError> {
    if project.repository.is_none() {
        return Err(ApiError::Workspace(WorkspaceError::NoRepository));
    }
    Ok(())
}

/// Get (creating on first use) the persistent git branch for a task.
pub async fn get_task_branch(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<TaskBranchResponse>>, ApiError> {
    require_git(&project)?;
    let branch = deployment.workspaces().ensure_task_branch(&task).await?;
    Ok(ResponseJson(ApiResponse::success(TaskBranchResponse {
        task_id: task.id,
        project_id: project.id,
        branch,
    })))
}

/// Create a persistent worktree for a task in the agent's sandbox. The
/// request is relayed to the engine over the event bus and the result key is
/// polled until it appears or the 30 s cap elapses.
pub async fn create_task_workspace(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Json(payload): Json<TaskWorkspaceRequest>,
) -> Result<ResponseJson<ApiResponse<WorktreeInfo>>, ApiError> {
    let info = deployment
        .workspaces()
        .request_worktree(&payload.agent_id, &project, &task)
        .await?;
    Ok(ResponseJson(ApiResponse::success(info)))
}

/// Fire-and-forget removal of a task worktree.
pub async fn remove_task_workspace(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Query(query): Query<RemoveWorkspaceQuery>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    deployment
        .workspaces()
        .request_worktree_removal(&query.agent_id, project.id, task.id)
        .await;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn open_task_pull_request(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Json(payload): Json<OpenPullRequestRequest>,
) -> Result<ResponseJson<ApiResponse<PullRequestInfo>>, ApiError> {
    let pr = deployment
        .workspaces()
        .open_pull_request(
            &project,
            &task,
            &payload.agent_id,
            &payload.title,
            &payload.body,
            payload.draft,
            payload.base_branch.as_deref().unwrap_or("main"),
        )
        .await?;
    Ok(ResponseJson(ApiResponse::success(pr)))
}

pub async fn get_task_pr_status(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<PrStatus>>, ApiError> {
    let status = deployment
        .workspaces()
        .pull_request_status(&project, &task)
        .await?;
    Ok(ResponseJson(ApiResponse::success(status)))
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let task_router = Router::new()
        .route("/branch", get(get_task_branch))
        .route(
            "/workspace",
            post(create_task_workspace).delete(remove_task_workspace),
        )
        .route("/pull-request", post(open_task_pull_request))
        .route("/pr-status", get(get_task_pr_status))
        .layer(from_fn_with_state(deployment.clone(), load_task_middleware))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    Router::new().nest("/projects/{project_id}/tasks/{task_id}", task_router)
}
