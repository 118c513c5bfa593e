use anyhow::anyhow;
use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use db::models::{
    dependency_edge::DependencyEdge,
    kanban_column::KanbanColumn,
    project::Project,
    task::{CreateTask, Task, TaskPriority, TaskRef, UpdateTask},
    task_run::TaskRun,
};
use services::services::work_type::{infer_work_type, is_valid_work_type};

use crate::{
    Deployment,
    error::ApiError,
    middleware::{load_project_middleware, load_task_middleware},
};

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub priority: Option<TaskPriority>,
    pub agent: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Deserialize, TS)]
pub struct MoveTaskRequest {
    pub column_id: Uuid,
    #[serde(default)]
    pub position: i32,
}

#[derive(Debug, Serialize, TS)]
pub struct TaskDetail {
    #[serde(flatten)]
    #[ts(flatten)]
    pub task: Task,
    pub blocking_dependencies: Vec<TaskRef>,
    pub dependents: Vec<TaskRef>,
    pub subtasks: Vec<TaskRef>,
    pub run_history: Vec<TaskRun>,
}

#[derive(Debug, Deserialize)]
pub struct ReadyTasksQuery {
    pub agent_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Comma-separated raw statuses (default: backlog,planning,ready).
    pub statuses: Option<String>,
    /// Comma-separated work types; unclassified tasks are always considered.
    pub work_types: Option<String>,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize, TS)]
pub struct ReadyTask {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: TaskPriority,
    pub assigned_agent: Option<String>,
    pub tags: Vec<String>,
    pub estimated_hours: Option<f64>,
    pub work_type: Option<String>,
    pub completed_stages: Vec<String>,
    /// Downstream tasks this one blocks, with their current status.
    pub blocking_tasks: Vec<TaskRef>,
}

#[derive(Debug, Serialize, TS)]
pub struct InProgressTask {
    pub id: Uuid,
    pub title: String,
    pub status: String,
    pub priority: TaskPriority,
    pub blocks: Vec<TaskRef>,
}

#[derive(Debug, Serialize, TS)]
pub struct ReadyTasksResponse {
    pub tasks: Vec<ReadyTask>,
    pub in_progress: Vec<InProgressTask>,
}

/// Create a task, inferring work type and resolving the initial
/// column/status from the project's board when the caller doesn't specify.
pub async fn create_task(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Json(payload): Json<CreateTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let pool = &deployment.db().pool;

    if let Some(work_type) = &payload.work_type
        && !is_valid_work_type(work_type)
    {
        return Err(ApiError::BadRequest(format!(
            "Unknown work type '{work_type}'"
        )));
    }

    let columns = KanbanColumn::find_by_project(pool, project.id).await?;
    if columns.is_empty() {
        return Err(ApiError::Other(anyhow!("Project has no columns")));
    }

    let semantics = project.semantics();
    let (column, status) = match payload.column_id {
        Some(column_id) => {
            let column = columns
                .iter()
                .find(|c| c.id == column_id)
                .ok_or_else(|| ApiError::NotFound(format!("Column {column_id} not found")))?;
            let status = column
                .entry_status()
                .unwrap_or(semantics.first_initial())
                .to_string();
            (column, status)
        }
        None => {
            // Tasks with no declared dependencies go straight to the ready
            // column when one exists; otherwise the first column mapping an
            // initial-semantic status, then the lowest-position column.
            let ready_col = columns.iter().find(|c| c.maps_status("ready"));
            let initial_col = columns
                .iter()
                .find(|c| c.statuses().iter().any(|s| semantics.is_initial(s)));
            let column = match (payload.parent_task_id.is_none(), ready_col, initial_col) {
                (true, Some(ready), _) => ready,
                (_, _, Some(initial)) => initial,
                _ => &columns[0],
            };
            let status = column
                .entry_status()
                .unwrap_or(semantics.first_initial())
                .to_string();
            (column, status)
        }
    };

    if let Some(parent_id) = payload.parent_task_id {
        let parent = Task::find_in_project(pool, project.id, parent_id)
            .await?
            .ok_or_else(|| ApiError::BadRequest(format!("Parent task {parent_id} not found")))?;
        if parent.parent_task_id.is_some() {
            return Err(ApiError::BadRequest(
                "Subtasks cannot be nested: the parent is itself a subtask".to_string(),
            ));
        }
    }

    let work_type = payload.work_type.clone().or_else(|| {
        infer_work_type(&payload.title, &payload.tags, &payload.description).map(String::from)
    });

    let position = Task::max_column_position(pool, column.id).await? + 1;
    let task = Task::create(
        pool,
        project.id,
        Uuid::new_v4(),
        &payload,
        &status,
        column.id,
        position,
        None,
        work_type,
    )
    .await?;

    deployment
        .events()
        .publish_global(
            "TASK_CREATED",
            json!({ "projectId": project.id, "taskId": task.id, "title": task.title }),
        )
        .await;

    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn list_tasks(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Query(query): Query<TaskListQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Task>>>, ApiError> {
    let tasks = Task::find_by_project(&deployment.db().pool, project.id).await?;
    let filtered = tasks
        .into_iter()
        .filter(|t| query.status.as_ref().is_none_or(|s| &t.status == s))
        .filter(|t| query.priority.is_none_or(|p| t.priority == p))
        .filter(|t| {
            query
                .agent
                .as_ref()
                .is_none_or(|a| t.assigned_agent.as_ref() == Some(a))
        })
        .filter(|t| query.tag.as_ref().is_none_or(|tag| t.tags.0.contains(tag)))
        .collect();
    Ok(ResponseJson(ApiResponse::success(filtered)))
}

/// Task detail with dependencies, subtasks and run history.
pub async fn get_task(
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<TaskDetail>>, ApiError> {
    let pool = &deployment.db().pool;
    let blocking_dependencies = DependencyEdge::upstream_refs(pool, task.id).await?;
    let dependents = DependencyEdge::downstream_refs(pool, task.id).await?;
    let subtasks = Task::find_subtasks(pool, task.id)
        .await?
        .into_iter()
        .map(|t| TaskRef {
            id: t.id,
            title: t.title,
            status: t.status,
        })
        .collect();
    let run_history = TaskRun::find_by_task(pool, task.id).await?;

    Ok(ResponseJson(ApiResponse::success(TaskDetail {
        task,
        blocking_dependencies,
        dependents,
        subtasks,
        run_history,
    })))
}

pub async fn update_task(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Json(payload): Json<UpdateTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let pool = &deployment.db().pool;
    let new_status = payload.status.clone();
    let mut updated = Task::update_fields(pool, task.id, &payload).await?;

    if let Some(status) = &new_status {
        let target_col = KanbanColumn::find_for_status(pool, project.id, status)
            .await?
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "No kanban column found for status '{status}' in this project"
                ))
            })?;
        let semantics = project.semantics();
        Task::apply_transition(pool, task.id, status, target_col.id, semantics.is_done(status))
            .await?;
        deployment.readiness().propagate(&project, task.id, status).await;
        if task.parent_task_id.is_some() {
            deployment.readiness().recompute_parent(&project, task.id).await;
        }
        updated = Task::find_by_id(pool, task.id)
            .await?
            .ok_or(ApiError::Database(sqlx::Error::RowNotFound))?;
    }

    let event_type = if new_status.is_some() {
        "TASK_STATUS_CHANGED"
    } else {
        "TASK_UPDATED"
    };
    deployment
        .events()
        .publish_global(
            event_type,
            json!({ "projectId": project.id, "taskId": task.id, "status": new_status }),
        )
        .await;

    Ok(ResponseJson(ApiResponse::success(updated)))
}

/// Delete a task; dependency edges and run history cascade at the database.
pub async fn delete_task(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let rows = Task::delete(&deployment.db().pool, task.id).await?;
    if rows == 0 {
        return Err(ApiError::Database(sqlx::Error::RowNotFound));
    }
    deployment
        .events()
        .publish_global(
            "TASK_DELETED",
            json!({ "projectId": project.id, "taskId": task.id }),
        )
        .await;
    Ok(ResponseJson(ApiResponse::success(())))
}

/// Drag-drop move. The task takes the first status mapped to the target
/// column; WIP limits are enforced before any state changes.
pub async fn move_task(
    Extension(project): Extension<Project>,
    Extension(task): Extension<Task>,
    State(deployment): State<Deployment>,
    Json(payload): Json<MoveTaskRequest>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let pool = &deployment.db().pool;
    let column = KanbanColumn::find_by_id(pool, payload.column_id)
        .await?
        .filter(|c| c.project_id == project.id)
        .ok_or_else(|| ApiError::NotFound(format!("Column {} not found", payload.column_id)))?;

    if let Some(wip_limit) = column.wip_limit {
        let occupied = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tasks WHERE column_id = $1 AND id <> $2",
        )
        .bind(column.id)
        .bind(task.id)
        .fetch_one(pool)
        .await?;
        if occupied >= wip_limit as i64 {
            return Err(ApiError::BadRequest(format!(
                "Column WIP limit ({wip_limit}) reached"
            )));
        }
    }

    let new_status = column
        .entry_status()
        .map(String::from)
        .unwrap_or_else(|| task.status.clone());
    Task::move_to_column(pool, task.id, column.id, payload.position, &new_status).await?;

    if new_status != task.status {
        deployment
            .readiness()
            .propagate(&project, task.id, &new_status)
            .await;
    }

    deployment
        .events()
        .publish_global(
            "TASK_MOVED",
            json!({ "projectId": project.id, "taskId": task.id, "columnId": column.id }),
        )
        .await;

    let moved = Task::find_by_id(pool, task.id)
        .await?
        .ok_or(ApiError::Database(sqlx::Error::RowNotFound))?;
    Ok(ResponseJson(ApiResponse::success(moved)))
}

/// The query an agent calls on each pulse to find work.
///
/// Candidates in already-actionable statuses (ready/in_progress/review) are
/// included directly; waiting statuses require every blocking dependency
/// (including the parent's, for subtasks) to be terminal-done. Container
/// parents are never returned. Each task carries its downstream dependents,
/// and the agent's own in-progress tasks ride along so parallel independence
/// can be judged in one call.
pub async fn get_ready_tasks(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Query(query): Query<ReadyTasksQuery>,
) -> Result<ResponseJson<ApiResponse<ReadyTasksResponse>>, ApiError> {
    let pool = &deployment.db().pool;
    let semantics = project.semantics();

    let valid_statuses = KanbanColumn::valid_statuses(pool, project.id).await?;
    let default_filter: Vec<String> = ["backlog", "planning", "ready"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let status_filter: Vec<String> = match &query.statuses {
        Some(raw) => {
            let requested: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter(|s| valid_statuses.iter().any(|v| v == s))
                .map(String::from)
                .collect();
            if requested.is_empty() {
                default_filter
            } else {
                requested
            }
        }
        None => default_filter,
    };

    let work_type_filter: Option<Vec<String>> = query.work_types.as_ref().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| is_valid_work_type(s))
            .map(String::from)
            .collect()
    });
    let work_type_filter = work_type_filter.filter(|f| !f.is_empty());

    let container_parents = Task::container_parent_ids(pool, project.id).await?;
    let candidates = Task::find_by_statuses(pool, project.id, &status_filter).await?;

    let mut ready = Vec::new();
    for task in candidates {
        if ready.len() >= query.limit {
            break;
        }
        if container_parents.contains(&task.id) {
            continue;
        }
        if let Some(agent_id) = &query.agent_id
            && task
                .assigned_agent
                .as_ref()
                .is_some_and(|assigned| assigned != agent_id)
        {
            continue;
        }
        if let Some(filter) = &work_type_filter
            && task
                .work_type
                .as_ref()
                .is_some_and(|wt| !filter.contains(wt))
        {
            continue;
        }

        // Tasks validated when they entered an actionable status skip the
        // dependency re-check.
        let actionable = matches!(task.status.as_str(), "ready" | "in_progress" | "review");
        if !actionable {
            let deps = DependencyEdge::blocking_predecessors(pool, task.id).await?;
            if !deps.iter().all(|d| semantics.is_done(&d.status)) {
                continue;
            }
            // Cross-level inheritance: a subtask waits on its parent's
            // upstream blockers too.
            if let Some(parent_id) = task.parent_task_id {
                let parent_deps = DependencyEdge::blocking_predecessors(pool, parent_id).await?;
                if !parent_deps.iter().all(|d| semantics.is_done(&d.status)) {
                    continue;
                }
            }
        }

        let blocking_tasks = DependencyEdge::downstream_refs(pool, task.id).await?;
        ready.push(ReadyTask {
            id: task.id,
            title: task.title,
            description: task.description,
            status: task.status,
            priority: task.priority,
            assigned_agent: task.assigned_agent,
            tags: task.tags.0,
            estimated_hours: task.estimated_hours,
            work_type: task.work_type,
            completed_stages: task.completed_stages.0,
            blocking_tasks,
        });
    }

    let mut in_progress = Vec::new();
    if let Some(agent_id) = &query.agent_id {
        let statuses: Vec<String> = vec!["in_progress".into(), "review".into()];
        for task in Task::find_by_statuses(pool, project.id, &statuses).await? {
            if task.assigned_agent.as_deref() != Some(agent_id) {
                continue;
            }
            let blocks = DependencyEdge::downstream_refs(pool, task.id).await?;
            in_progress.push(InProgressTask {
                id: task.id,
                title: task.title,
                status: task.status,
                priority: task.priority,
                blocks,
            });
        }
    }

    Ok(ResponseJson(ApiResponse::success(ReadyTasksResponse {
        tasks: ready,
        in_progress,
    })))
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let task_id_router = Router::new()
        .route("/", get(get_task).put(update_task).delete(delete_task))
        .route("/move", post(move_task))
        .layer(from_fn_with_state(deployment.clone(), load_task_middleware))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    let tasks_router = Router::new()
        .route("/", get(list_tasks).post(create_task))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    let ready_router = Router::new()
        .route("/", get(get_ready_tasks))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    Router::new()
        .nest("/projects/{project_id}/tasks/{task_id}", task_id_router)
        .nest("/projects/{project_id}/tasks", tasks_router)
        .nest("/projects/{project_id}/ready-tasks", ready_router)
}
