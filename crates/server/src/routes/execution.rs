use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::post,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ts_rs::TS;
use utils::{response::ApiResponse, time::now_ms};
use uuid::Uuid;

use db::models::{
    kanban_column::KanbanColumn,
    project::Project,
    task::{Task, TaskMetadata, TransitionNote},
    workflow_policy::{
        StageDisposition, WorkflowPolicy, next_valid_stages, stage_for_status,
    },
};
use services::services::{
    dispatch::{DispatchError, resolve_pipeline},
    pulse::{agent_for_role, legacy_agent_for_status},
    workspace::task_branch_name,
};

use crate::{
    Deployment,
    error::ApiError,
    middleware::{load_project_middleware, load_task_middleware},
};

#[derive(Debug, Deserialize, TS)]
pub struct ClaimTaskRequest {
    #[serde(alias = "agentId")]
    pub agent_id: String,
}

#[derive(Debug, Serialize, TS)]
pub struct ClaimResult {
    pub status: &'static str,
    pub task_id: Uuid,
    pub agent_id: String,
    pub branch: String,
}

#[derive(Debug, Deserialize, TS)]
pub struct TransitionTaskRequest {
    pub status: String,
    pub note: Option<String>,
}

#[derive(Debug, Serialize, TS)]
pub struct TransitionResult {
    pub status: &'static str,
    pub task_id: Uuid,
    pub from_status: String,
    pub to_status: String,
    pub column_id: Uuid,
    pub work_type: Option<String>,
    pub completed_stages: Vec<String>,
    pub next_valid_stages: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, TS)]
pub struct ExecuteTaskRequest {
    #[serde(alias = "pipelineId")]
    pub pipeline_id: Option<String>,
    #[serde(alias = "workflowId")]
    pub workflow_id: Option<String>,
    pub context: Option<String>,
    #[serde(alias = "modelOverride")]
    pub model_override: Option<String>,
    #[serde(alias = "keyUserId")]
    pub key_user_id: Option<String>,
}

#[derive(Debug, Serialize, TS)]
pub struct ExecuteTaskResponse {
    pub status: &'static str,
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub pipeline_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteReadyQuery {
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

fn default_max_tasks() -> usize {
    5
}

#[derive(Debug, Serialize, TS)]
pub struct SkippedTask {
    pub task_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Serialize, TS)]
pub struct ExecuteReadyResponse {
    pub status: &'static str,
    pub executed: usize,
    pub skipped: usize,
    pub tasks: Vec<ExecuteTaskResponse>,
    pub skipped_tasks: Vec<SkippedTask>,
}

#[derive(Debug, Deserialize)]
pub struct RunCompletedQuery {
    pub run_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, TS)]
pub struct RunCompletedResponse {
    pub status: &'static str,
    pub task_status: Option<String>,
}

fn ensure_branch(meta: &mut TaskMetadata, task_id: Uuid, title: &str) -> String {
    match &meta.git_branch {
        Some(branch) => branch.clone(),
        None => {
            let branch = task_branch_name(task_id, title);
            meta.git_branch = Some(branch.clone());
            branch
        }
    }
}

/// Atomically claim a task for an agent.
///
/// The row is fetched FOR UPDATE inside a transaction, so concurrent claim
/// requests are serialized by the database: the second caller blocks until
/// the first commits, then sees the updated assignee and gets a 409.
pub async fn claim_task(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Json(payload): Json<ClaimTaskRequest>,
) -> Result<ResponseJson<ApiResponse<ClaimResult>>, ApiError> {
    let pool = &deployment.db().pool;
    let mut tx = pool.begin().await?;

    let locked = Task::find_in_project_for_update(&mut *tx, project.id, task.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", task.id)))?;

    // Already claimed by this agent: idempotent.
    if locked.assigned_agent.as_deref() == Some(payload.agent_id.as_str()) {
        let mut meta = locked.metadata().clone();
        let had_branch = meta.git_branch.is_some();
        let branch = ensure_branch(&mut meta, locked.id, &locked.title);
        if !had_branch {
            Task::set_metadata(&mut *tx, locked.id, &meta).await?;
        }
        tx.commit().await?;
        return Ok(ResponseJson(ApiResponse::success(ClaimResult {
            status: "already_claimed",
            task_id: locked.id,
            agent_id: payload.agent_id,
            branch,
        })));
    }

    if let Some(owner) = &locked.assigned_agent {
        return Err(ApiError::Conflict(format!(
            "Task is already claimed by agent '{owner}'"
        )));
    }

    let semantics = project.semantics();
    if !semantics.is_claimable(&locked.status) {
        return Err(ApiError::BadRequest(format!(
            "Task cannot be claimed in '{}' status. Must be one of: {:?}",
            locked.status, semantics.claimable
        )));
    }

    let mut meta = locked.metadata().clone();
    let branch = ensure_branch(&mut meta, locked.id, &locked.title);
    Task::set_metadata(&mut *tx, locked.id, &meta).await?;
    Task::set_assigned_agent(&mut *tx, locked.id, &payload.agent_id).await?;
    tx.commit().await?;

    deployment
        .events()
        .publish_global(
            "TASK_CLAIMED",
            json!({
                "projectId": project.id,
                "taskId": task.id,
                "agentId": payload.agent_id,
                "branch": branch,
            }),
        )
        .await;

    tracing::debug!("Task {} claimed by {}, branch: {branch}", task.id, payload.agent_id);
    Ok(ResponseJson(ApiResponse::success(ClaimResult {
        status: "claimed",
        task_id: task.id,
        agent_id: payload.agent_id,
        branch,
    })))
}

/// Transition a task to a new status and move it to the matching column.
/// Agents call this from their pulse routines to advance the board; it also
/// fires the dependency cascade and transition-triggered wakes.
pub async fn transition_task(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Json(payload): Json<TransitionTaskRequest>,
) -> Result<ResponseJson<ApiResponse<TransitionResult>>, ApiError> {
    let pool = &deployment.db().pool;
    let semantics = project.semantics();

    // Valid targets come from the project's columns, never a hardcoded list.
    let valid_statuses = KanbanColumn::valid_statuses(pool, project.id).await?;
    if !valid_statuses.contains(&payload.status) {
        return Err(ApiError::BadRequest(format!(
            "Invalid status '{}'. Must be one of: {:?}",
            payload.status, valid_statuses
        )));
    }

    let policy = WorkflowPolicy::find_by_project(pool, project.id).await?;
    let target_stage = stage_for_status(&payload.status);
    let mut completed_stages = task.completed_stages.0.clone();

    if let (Some(policy), Some(work_type), Some(stage)) =
        (&policy, &task.work_type, target_stage)
        && let Some(rule) = policy.rule_for_stage(work_type, stage)
        && rule.disposition == StageDisposition::Skip
    {
        let next = policy
            .rules_for(work_type)
            .map(|rules| next_valid_stages(rules, &completed_stages))
            .unwrap_or_default();
        return Err(ApiError::BadRequest(format!(
            "Stage '{stage}' is skipped for {work_type} tasks. Valid next stages: {next:?}"
        )));
    }

    let target_col = KanbanColumn::find_for_status(pool, project.id, &payload.status)
        .await?
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "No kanban column found for status '{}' in this project",
                payload.status
            ))
        })?;

    let old_status = task.status.clone();
    let completed = semantics.is_done(&payload.status);

    // Leaving a stage records it as completed.
    if let Some(old_stage) = stage_for_status(&old_status)
        && !completed_stages.iter().any(|s| s == old_stage)
    {
        completed_stages.push(old_stage.to_string());
    }

    let mut meta = task.metadata().clone();
    if let Some(note) = &payload.note {
        meta.transition_notes.push(TransitionNote {
            from: old_status.clone(),
            to: payload.status.clone(),
            note: note.clone(),
            timestamp: now_ms(),
        });
    }

    let mut tx = pool.begin().await?;
    Task::apply_transition(&mut *tx, task.id, &payload.status, target_col.id, completed).await?;
    Task::set_metadata(&mut *tx, task.id, &meta).await?;
    tx.commit().await?;
    Task::set_completed_stages(pool, task.id, &completed_stages).await?;

    // Unconditional: terminal statuses fan out the done/fail cascade, and a
    // move back to a working status lets blocked dependents recover.
    deployment
        .readiness()
        .propagate(&project, task.id, &payload.status)
        .await;
    if task.parent_task_id.is_some() {
        deployment.readiness().recompute_parent(&project, task.id).await;
    }

    deployment
        .events()
        .publish_global(
            "TASK_STATUS_CHANGED",
            json!({
                "projectId": project.id,
                "taskId": task.id,
                "fromStatus": old_status,
                "toStatus": payload.status,
                "note": payload.note,
            }),
        )
        .await;

    // Wake the agent responsible for the stage the task just entered, via
    // the workflow policy when one names a role, else the legacy triggers.
    let triggered_agent = match (&policy, &task.work_type, target_stage) {
        (Some(policy), Some(work_type), Some(stage)) => policy
            .rule_for_stage(work_type, stage)
            .and_then(|rule| rule.agent_role.as_deref())
            .and_then(agent_for_role)
            .or_else(|| legacy_agent_for_status(&payload.status)),
        _ => legacy_agent_for_status(&payload.status),
    };
    if let Some(agent_id) = triggered_agent {
        let context = format!(
            "Task '{}' moved to {} in project {}",
            task.title, payload.status, project.id
        );
        if let Err(e) = deployment.pulse().trigger(agent_id, None, &context).await {
            tracing::error!("Transition pulse failed for {agent_id}: {e}");
        }
    }

    // Completed tasks no longer need their worktree.
    if completed && let Some(agent) = &task.assigned_agent {
        deployment
            .workspaces()
            .request_worktree_removal(agent, project.id, task.id)
            .await;
    }

    let next = match (&policy, &task.work_type) {
        (Some(policy), Some(work_type)) => policy
            .rules_for(work_type)
            .map(|rules| next_valid_stages(rules, &completed_stages)),
        _ => None,
    };

    Ok(ResponseJson(ApiResponse::success(TransitionResult {
        status: "transitioned",
        task_id: task.id,
        from_status: old_status,
        to_status: payload.status,
        column_id: target_col.id,
        work_type: task.work_type.clone(),
        completed_stages,
        next_valid_stages: next,
    })))
}

/// Start a pipeline run for a task.
pub async fn execute_task(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Json(payload): Json<ExecuteTaskRequest>,
) -> Result<ResponseJson<ApiResponse<ExecuteTaskResponse>>, ApiError> {
    let semantics = project.semantics();
    let executable =
        semantics.is_claimable(&task.status) || semantics.is_initial(&task.status);
    if !executable {
        return Err(ApiError::BadRequest(format!(
            "Cannot execute task in '{}' status. Must be claimable or initial.",
            task.status
        )));
    }

    let pipeline_id = resolve_pipeline(
        payload.pipeline_id.as_deref(),
        task.pipeline_id.as_deref(),
        project.default_pipeline_id.as_deref(),
    )
    .ok_or(ApiError::Dispatch(DispatchError::NoPipeline))?;

    let initiated_by = payload.key_user_id.clone();
    let run = deployment
        .dispatcher()
        .execute_task(
            &project,
            &task,
            &pipeline_id,
            payload.context.as_deref(),
            initiated_by,
            payload.model_override.clone(),
        )
        .await?;

    Ok(ResponseJson(ApiResponse::success(ExecuteTaskResponse {
        status: "executing",
        task_id: task.id,
        run_id: run.id,
        pipeline_id,
    })))
}

/// Execute all ready tasks in a project (up to max_tasks), skipping tasks
/// whose assigned agent is already busy.
pub async fn execute_ready_tasks(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Query(query): Query<ExecuteReadyQuery>,
) -> Result<ResponseJson<ApiResponse<ExecuteReadyResponse>>, ApiError> {
    let pool = &deployment.db().pool;

    let ready_statuses = vec!["ready".to_string()];
    let ready_tasks = Task::find_by_statuses(pool, project.id, &ready_statuses).await?;
    if ready_tasks.is_empty() {
        return Ok(ResponseJson(ApiResponse::success(ExecuteReadyResponse {
            status: "no_ready_tasks",
            executed: 0,
            skipped: 0,
            tasks: Vec::new(),
            skipped_tasks: Vec::new(),
        })));
    }

    let busy_statuses = vec!["in_progress".to_string()];
    let mut busy_agents = Task::busy_agents(pool, project.id, &busy_statuses).await?;

    let mut executed = Vec::new();
    let mut skipped = Vec::new();
    for task in ready_tasks.into_iter().take(query.max_tasks) {
        if let Some(agent) = &task.assigned_agent
            && busy_agents.contains(agent)
        {
            skipped.push(SkippedTask {
                task_id: task.id,
                reason: format!("Agent {agent} is busy"),
            });
            continue;
        }

        let Some(pipeline_id) = resolve_pipeline(
            None,
            task.pipeline_id.as_deref(),
            project.default_pipeline_id.as_deref(),
        ) else {
            skipped.push(SkippedTask {
                task_id: task.id,
                reason: "No pipeline assigned".to_string(),
            });
            continue;
        };

        match deployment
            .dispatcher()
            .execute_task(&project, &task, &pipeline_id, None, None, None)
            .await
        {
            Ok(run) => {
                executed.push(ExecuteTaskResponse {
                    status: "executing",
                    task_id: task.id,
                    run_id: run.id,
                    pipeline_id,
                });
                if let Some(agent) = task.assigned_agent {
                    busy_agents.push(agent);
                }
            }
            Err(e) => skipped.push(SkippedTask {
                task_id: task.id,
                reason: e.to_string(),
            }),
        }
    }

    Ok(ResponseJson(ApiResponse::success(ExecuteReadyResponse {
        status: "executed",
        executed: executed.len(),
        skipped: skipped.len(),
        tasks: executed,
        skipped_tasks: skipped,
    })))
}

/// Worker webhook: a run linked to this task completed or failed.
pub async fn task_run_completed(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Query(query): Query<RunCompletedQuery>,
) -> Result<ResponseJson<ApiResponse<RunCompletedResponse>>, ApiError> {
    let new_status = deployment
        .dispatcher()
        .run_completed(&project, &task, query.run_id, &query.status)
        .await?;

    match new_status {
        Some(task_status) => Ok(ResponseJson(ApiResponse::success(RunCompletedResponse {
            status: "updated",
            task_status: Some(task_status),
        }))),
        None => Ok(ResponseJson(ApiResponse::success(RunCompletedResponse {
            status: "ignored",
            task_status: None,
        }))),
    }
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let task_router = Router::new()
        .route("/claim", post(claim_task))
        .route("/transition", post(transition_task))
        .route("/execute", post(execute_task))
        .route("/run-completed", post(task_run_completed))
        .layer(from_fn_with_state(deployment.clone(), load_task_middleware))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    let project_router = Router::new()
        .route("/", post(execute_ready_tasks))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    Router::new()
        .nest("/projects/{project_id}/tasks/{task_id}", task_router)
        .nest("/projects/{project_id}/execute-ready", project_router)
}
