use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use db::models::{
    loop_state::{LoopItem, LoopState, next_pending_index},
    output::Output,
    run::{CreateRun, Run, RunStatus, UpdateRun},
    step::{CreateStep, Step, StepStatus, UpdateStep},
};

use crate::{Deployment, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct RunListQuery {
    pub pipeline_id: Option<String>,
    pub status: Option<RunStatus>,
}

#[derive(Debug, Deserialize, TS)]
pub struct RestartRequest {
    pub context: Option<String>,
}

#[derive(Debug, Serialize, TS)]
pub struct RunDetail {
    #[serde(flatten)]
    #[ts(flatten)]
    pub run: Run,
    pub workspace_exists: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct StepListQuery {
    pub status: Option<StepStatus>,
}

#[derive(Debug, Deserialize, TS)]
pub struct CreateLoopStateRequest {
    pub step_id: String,
    pub items: Vec<LoopItem>,
    #[serde(default)]
    pub current_index: i32,
}

#[derive(Debug, Deserialize, TS)]
pub struct UpdateLoopItemRequest {
    pub status: Option<String>,
    #[ts(type = "unknown")]
    pub output: Option<Value>,
}

#[derive(Debug, Serialize, TS)]
pub struct AdvanceLoopResponse {
    pub next_item: Option<LoopItem>,
    pub index: Option<i32>,
}

#[derive(Debug, Deserialize, TS)]
pub struct SetOutputRequest {
    pub step_id: String,
    pub key: String,
    pub value: String,
}

pub async fn start_run(
    State(deployment): State<Deployment>,
    Json(payload): Json<CreateRun>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    let run = deployment.dispatcher().start_run(payload).await?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub async fn list_runs(
    State(deployment): State<Deployment>,
    Query(query): Query<RunListQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Run>>>, ApiError> {
    let runs = Run::find_all(
        &deployment.db().pool,
        query.pipeline_id.as_deref(),
        query.status,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(runs)))
}

/// Run detail including step progress and whether the workspace directory
/// exists on disk (persistent projects use the project workspace, ephemeral
/// runs their own directory under SHARED_RUNS_DIR).
pub async fn get_run(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<RunDetail>>, ApiError> {
    let pool = &deployment.db().pool;
    let run = Run::find_by_id(pool, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {run_id} not found")))?;
    let steps = Step::find_by_run(pool, run_id, None).await?;

    let runs_dir =
        std::env::var("SHARED_RUNS_DIR").unwrap_or_else(|_| "/data/runs".to_string());
    let workspace_path = match (run.workspace_type, run.project_id) {
        (
            Some(db::models::project::WorkspaceType::PersistentDirectory),
            Some(project_id),
        ) => services::services::workspace::workspaces_dir().join(project_id.to_string()),
        _ => std::path::PathBuf::from(runs_dir).join(run_id.to_string()),
    };

    Ok(ResponseJson(ApiResponse::success(RunDetail {
        run,
        workspace_exists: workspace_path.exists(),
        steps,
    })))
}

pub async fn update_run(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
    Json(payload): Json<UpdateRun>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    let run = Run::update(&deployment.db().pool, run_id, &payload).await?;
    deployment
        .events()
        .publish_global(
            "RUN_UPDATED",
            serde_json::json!({ "runId": run_id, "status": run.status.to_string() }),
        )
        .await;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub async fn cancel_run(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    deployment.dispatcher().cancel_run(run_id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn restart_run(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
    payload: Option<Json<RestartRequest>>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    let context = payload.as_ref().and_then(|p| p.context.as_deref());
    let run = deployment.dispatcher().restart_run(run_id, context).await?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub async fn pause_run(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    deployment.dispatcher().pause_run(run_id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(Debug, Serialize, TS)]
pub struct ResumeResponse {
    pub run_id: Uuid,
    pub requeued_steps: usize,
}

pub async fn resume_run(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<ResumeResponse>>, ApiError> {
    let requeued = deployment.dispatcher().resume_run(run_id).await?;
    Ok(ResponseJson(ApiResponse::success(ResumeResponse {
        run_id,
        requeued_steps: requeued,
    })))
}

pub async fn get_run_logs(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<Value>>>, ApiError> {
    let logs = deployment.events().run_log(run_id).await;
    Ok(ResponseJson(ApiResponse::success(logs)))
}

pub async fn delete_run(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let rows = Run::delete(&deployment.db().pool, run_id).await?;
    if rows == 0 {
        return Err(ApiError::NotFound("Run not found".to_string()));
    }
    deployment
        .events()
        .publish_global("RUN_DELETED", serde_json::json!({ "runId": run_id }))
        .await;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn list_run_steps(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<StepListQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Step>>>, ApiError> {
    let steps = Step::find_by_run(&deployment.db().pool, run_id, query.status).await?;
    Ok(ResponseJson(ApiResponse::success(steps)))
}

pub async fn create_step(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
    Json(payload): Json<CreateStep>,
) -> Result<ResponseJson<ApiResponse<Step>>, ApiError> {
    let step = deployment.dispatcher().create_step(run_id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(step)))
}

pub async fn update_step(
    State(deployment): State<Deployment>,
    Path((run_id, step_id)): Path<(Uuid, String)>,
    Json(payload): Json<UpdateStep>,
) -> Result<ResponseJson<ApiResponse<Step>>, ApiError> {
    let step = deployment
        .dispatcher()
        .update_step(run_id, &step_id, &payload)
        .await?;
    Ok(ResponseJson(ApiResponse::success(step)))
}

pub async fn restart_step(
    State(deployment): State<Deployment>,
    Path((run_id, step_id)): Path<(Uuid, String)>,
    payload: Option<Json<RestartRequest>>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    let context = payload.as_ref().and_then(|p| p.context.as_deref());
    let run = deployment
        .dispatcher()
        .restart_step(run_id, &step_id, context)
        .await?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub async fn get_run_outputs(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<HashMap<String, String>>>, ApiError> {
    let outputs = Output::find_by_run(&deployment.db().pool, run_id).await?;
    let map = outputs.into_iter().map(|o| (o.key, o.value)).collect();
    Ok(ResponseJson(ApiResponse::success(map)))
}

pub async fn set_run_output(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
    Json(payload): Json<SetOutputRequest>,
) -> Result<ResponseJson<ApiResponse<Output>>, ApiError> {
    let pool = &deployment.db().pool;
    Run::find_by_id(pool, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {run_id} not found")))?;
    let output =
        Output::upsert(pool, run_id, &payload.step_id, &payload.key, &payload.value).await?;
    Ok(ResponseJson(ApiResponse::success(output)))
}

pub async fn create_loop_state(
    State(deployment): State<Deployment>,
    Path(run_id): Path<Uuid>,
    Json(payload): Json<CreateLoopStateRequest>,
) -> Result<ResponseJson<ApiResponse<LoopState>>, ApiError> {
    let pool = &deployment.db().pool;
    Run::find_by_id(pool, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {run_id} not found")))?;
    let state = LoopState::upsert(
        pool,
        run_id,
        &payload.step_id,
        &payload.items,
        payload.current_index,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(state)))
}

pub async fn get_loop_state(
    State(deployment): State<Deployment>,
    Path((run_id, step_id)): Path<(Uuid, String)>,
) -> Result<ResponseJson<ApiResponse<LoopState>>, ApiError> {
    let state = LoopState::find(&deployment.db().pool, run_id, &step_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Loop state not found for step {step_id}")))?;
    Ok(ResponseJson(ApiResponse::success(state)))
}

pub async fn update_loop_item(
    State(deployment): State<Deployment>,
    Path((run_id, step_id, item_id)): Path<(Uuid, String, String)>,
    Json(payload): Json<UpdateLoopItemRequest>,
) -> Result<ResponseJson<ApiResponse<LoopState>>, ApiError> {
    let pool = &deployment.db().pool;
    let state = LoopState::find(pool, run_id, &step_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Loop state not found for step {step_id}")))?;

    let mut items = state.items.0.clone();
    let item = items
        .iter_mut()
        .find(|item| item.id == item_id)
        .ok_or_else(|| ApiError::NotFound(format!("Loop item {item_id} not found")))?;
    if let Some(status) = payload.status {
        item.status = status;
    }
    if let Some(output) = payload.output {
        item.output = Some(output);
    }

    LoopState::save_items(pool, run_id, &step_id, &items).await?;
    let updated = LoopState::find(pool, run_id, &step_id)
        .await?
        .ok_or(ApiError::Database(sqlx::Error::RowNotFound))?;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

/// Advance to the next pending item. Returns null when the loop is done.
pub async fn advance_loop(
    State(deployment): State<Deployment>,
    Path((run_id, step_id)): Path<(Uuid, String)>,
) -> Result<ResponseJson<ApiResponse<AdvanceLoopResponse>>, ApiError> {
    let pool = &deployment.db().pool;
    let state = LoopState::find(pool, run_id, &step_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Loop state not found for step {step_id}")))?;

    match next_pending_index(&state.items.0, state.current_index.max(0) as usize) {
        Some(index) => {
            LoopState::set_current_index(pool, run_id, &step_id, index as i32).await?;
            Ok(ResponseJson(ApiResponse::success(AdvanceLoopResponse {
                next_item: Some(state.items.0[index].clone()),
                index: Some(index as i32),
            })))
        }
        None => Ok(ResponseJson(ApiResponse::success(AdvanceLoopResponse {
            next_item: None,
            index: None,
        }))),
    }
}

pub fn router(_deployment: &Deployment) -> Router<Deployment> {
    let run_id_router = Router::new()
        .route("/", get(get_run).patch(update_run).delete(delete_run))
        .route("/cancel", post(cancel_run))
        .route("/restart", post(restart_run))
        .route("/pause", post(pause_run))
        .route("/resume", post(resume_run))
        .route("/logs", get(get_run_logs))
        .route("/steps", get(list_run_steps).post(create_step))
        .route("/steps/{step_id}", patch(update_step))
        .route("/steps/{step_id}/restart", post(restart_step))
        .route("/outputs", get(get_run_outputs).put(set_run_output))
        .route("/loop-state", post(create_loop_state))
        .route("/loop-state/{step_id}", get(get_loop_state))
        .route("/loop-state/{step_id}/advance", post(advance_loop))
        .route(
            "/loop-state/{step_id}/items/{item_id}",
            patch(update_loop_item),
        );

    let inner = Router::new()
        .route("/", get(list_runs).post(start_run))
        .nest("/{run_id}", run_id_router);

    Router::new().nest("/runs", inner)
}
