use std::collections::HashMap;

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
    dependency_edge::{DependencyEdge, DependencyType},
    kanban_column::KanbanColumn,
    project::Project,
    task::{CreateTask, Task, TaskPriority},
};
use services::services::{
    graph::has_cycle,
    timeline::{TimelineResult, project_timeline},
    work_type::infer_work_type,
};

use crate::{Deployment, error::ApiError, middleware::load_project_middleware};

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    #[serde(default = "default_hours_per_day")]
    pub hours_per_day: f64,
}

fn default_hours_per_day() -> f64 {
    8.0
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct ImportTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, alias = "estimatedHours")]
    pub estimated_hours: Option<f64>,
    /// Title references to other imported tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<ImportSubtask>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct ImportSubtask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, alias = "estimatedHours")]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Deserialize, TS)]
pub struct BulkImportRequest {
    pub tasks: Vec<ImportTask>,
}

#[derive(Debug, Serialize, TS)]
pub struct BulkImportResponse {
    pub status: &'static str,
    pub tasks_created: usize,
    pub dependencies_created: usize,
    #[ts(type = "Record<string, string>")]
    pub title_to_id: HashMap<String, Uuid>,
}

pub async fn get_project_timeline(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Query(query): Query<TimelineQuery>,
) -> Result<ResponseJson<ApiResponse<TimelineResult>>, ApiError> {
    let timeline =
        project_timeline(&deployment.db().pool, &project, query.hours_per_day).await?;
    Ok(ResponseJson(ApiResponse::success(timeline)))
}

/// Import tasks from planner output. The combined dependency graph is
/// validated before anything is inserted: unknown title references or a
/// cycle reject the whole import, leaving the database unchanged.
pub async fn bulk_import_tasks(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Json(payload): Json<BulkImportRequest>,
) -> Result<ResponseJson<ApiResponse<BulkImportResponse>>, ApiError> {
    let pool = &deployment.db().pool;

    let columns = KanbanColumn::find_by_project(pool, project.id).await?;
    if columns.is_empty() {
        return Err(ApiError::Other(anyhow::anyhow!("Project has no columns")));
    }
    let backlog_col = &columns[0];
    let ready_col = columns.iter().find(|c| c.maps_status("ready"));

    // First pass: assign ids to every title, including subtasks. Titles are
    // the dependency references, so a repeated title would make the import
    // ambiguous; reject the whole batch before touching the database.
    let mut title_to_id: HashMap<String, Uuid> = HashMap::new();
    let mut duplicates: Vec<String> = Vec::new();
    {
        let mut assign = |title: &str| {
            if title_to_id
                .insert(title.to_string(), Uuid::new_v4())
                .is_some()
                && !duplicates.iter().any(|d| d == title)
            {
                duplicates.push(title.to_string());
            }
        };
        for task in &payload.tasks {
            assign(&task.title);
            for subtask in &task.subtasks {
                assign(&subtask.title);
            }
        }
    }
    if !duplicates.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "Import rejected: duplicate task titles: {}",
            duplicates.join(", ")
        )));
    }

    // Second pass: resolve dependency edges by title, all-or-nothing.
    let mut edges: Vec<(Uuid, Uuid)> = Vec::new();
    let mut resolve = |task_title: &str, deps: &[String]| -> Result<(), ApiError> {
        let to_id = title_to_id[task_title];
        for dep_title in deps {
            let from_id = *title_to_id.get(dep_title).ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Task '{task_title}' depends on unknown task '{dep_title}'"
                ))
            })?;
            edges.push((from_id, to_id));
        }
        Ok(())
    };
    for task in &payload.tasks {
        resolve(&task.title, &task.dependencies)?;
        for subtask in &task.subtasks {
            resolve(&subtask.title, &subtask.dependencies)?;
        }
    }

    let all_ids: Vec<Uuid> = title_to_id.values().copied().collect();
    if has_cycle(&all_ids, &edges) {
        return Err(ApiError::BadRequest(
            "Import rejected: dependency graph contains a cycle".to_string(),
        ));
    }

    // Tasks with no incoming blocks edge are immediately actionable.
    let blocked_ids: Vec<Uuid> = edges.iter().map(|(_, to)| *to).collect();
    fn placement<'a>(
        blocked_ids: &[Uuid],
        ready_col: Option<&'a KanbanColumn>,
        backlog_col: &'a KanbanColumn,
        task_id: Uuid,
    ) -> (&'a KanbanColumn, &'a str) {
        match (blocked_ids.contains(&task_id), ready_col) {
            (false, Some(ready)) => (ready, "ready"),
            _ => (backlog_col, backlog_col.entry_status().unwrap_or("backlog")),
        }
    }

    let mut tx = pool.begin().await?;
    let mut position = 0i32;
    let mut tasks_created = 0usize;
    for task in &payload.tasks {
        let task_id = title_to_id[&task.title];
        let (column, status) = placement(&blocked_ids, ready_col, backlog_col, task_id);
        let work_type = infer_work_type(&task.title, &task.tags, &task.description);
        Task::create(
            &mut *tx,
            project.id,
            task_id,
            &CreateTask {
                title: task.title.clone(),
                description: task.description.clone(),
                priority: task.priority,
                assigned_agent: None,
                workflow_id: None,
                parent_task_id: None,
                tags: task.tags.clone(),
                estimated_hours: task.estimated_hours,
                column_id: None,
                metadata: Default::default(),
                work_type: None,
            },
            status,
            column.id,
            position,
            None,
            work_type.map(String::from),
        )
        .await?;
        position += 1;
        tasks_created += 1;

        for subtask in &task.subtasks {
            let subtask_id = title_to_id[&subtask.title];
            let (column, status) = placement(&blocked_ids, ready_col, backlog_col, subtask_id);
            let work_type = infer_work_type(&subtask.title, &subtask.tags, &subtask.description);
            Task::create(
                &mut *tx,
                project.id,
                subtask_id,
                &CreateTask {
                    title: subtask.title.clone(),
                    description: subtask.description.clone(),
                    priority: subtask.priority,
                    assigned_agent: None,
                    workflow_id: None,
                    parent_task_id: Some(task_id),
                    tags: subtask.tags.clone(),
                    estimated_hours: subtask.estimated_hours,
                    column_id: None,
                    metadata: Default::default(),
                    work_type: None,
                },
                status,
                column.id,
                position,
                None,
                work_type.map(String::from),
            )
            .await?;
            position += 1;
            tasks_created += 1;
        }
    }

    for (from_id, to_id) in &edges {
        DependencyEdge::create(&mut *tx, project.id, *from_id, *to_id, DependencyType::Blocks)
            .await?;
    }
    tx.commit().await?;

    deployment
        .events()
        .publish_global(
            "TASKS_IMPORTED",
            json!({ "projectId": project.id, "count": tasks_created }),
        )
        .await;

    Ok(ResponseJson(ApiResponse::success(BulkImportResponse {
        status: "imported",
        tasks_created,
        dependencies_created: edges.len(),
        title_to_id,
    })))
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let timeline_router = Router::new()
        .route("/", get(get_project_timeline))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    let import_router = Router::new()
        .route("/", post(bulk_import_tasks))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    Router::new()
        .nest("/projects/{project_id}/timeline", timeline_router)
        .nest("/projects/{project_id}/import", import_router)
}
