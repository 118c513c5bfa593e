use axum::{
    Extension, Json, Router,
    extract::State,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::get,
};
use serde::Deserialize;
use ts_rs::TS;
use utils::response::ApiResponse;

use db::models::{
    project::Project,
    workflow_policy::{StageRules, WorkflowPolicy},
};

use crate::{Deployment, error::ApiError, middleware::load_project_middleware};

#[derive(Debug, Deserialize, TS)]
pub struct PutWorkflowPolicyRequest {
    #[ts(type = "Record<string, unknown>")]
    pub stage_rules: StageRules,
}

pub async fn get_workflow_policy(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<Option<WorkflowPolicy>>>, ApiError> {
    let policy = WorkflowPolicy::find_by_project(&deployment.db().pool, project.id).await?;
    Ok(ResponseJson(ApiResponse::success(policy)))
}

pub async fn put_workflow_policy(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Json(payload): Json<PutWorkflowPolicyRequest>,
) -> Result<ResponseJson<ApiResponse<WorkflowPolicy>>, ApiError> {
    let policy =
        WorkflowPolicy::upsert(&deployment.db().pool, project.id, &payload.stage_rules).await?;
    Ok(ResponseJson(ApiResponse::success(policy)))
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let policy_router = Router::new()
        .route("/", get(get_workflow_policy).put(put_workflow_policy))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    Router::new().nest("/projects/{project_id}/workflow-policy", policy_router)
}
