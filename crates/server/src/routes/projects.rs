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
    kanban_column::{CreateKanbanColumn, KanbanColumn},
    project::{CreateProject, Project, ProjectStatus, UpdateProject},
    task::Task,
};
use services::services::workspace::RepoSetupResult;

use crate::{Deployment, error::ApiError, middleware::load_project_middleware};

/// Default board created for every new project. Each column maps exactly one
/// raw status; the default status semantics reference these names.
const DEFAULT_COLUMNS: &[(&str, Option<i32>, &str)] = &[
    ("Backlog", None, "backlog"),
    ("Planning", None, "planning"),
    ("Blocked", None, "blocked"),
    ("Ready", None, "ready"),
    ("In Progress", Some(5), "in_progress"),
    ("Review", None, "review"),
    ("Done", None, "done"),
    ("Failed", None, "failed"),
];

#[derive(Debug, Deserialize)]
pub struct ProjectListQuery {
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Serialize, TS)]
pub struct CreatedProject {
    #[serde(flatten)]
    #[ts(flatten)]
    pub project: Project,
    pub repo_setup: Option<RepoSetupResult>,
}

#[derive(Debug, Serialize, TS)]
pub struct ProjectSummary {
    #[serde(flatten)]
    #[ts(flatten)]
    pub project: Project,
    pub total_tasks: i64,
    pub completed_tasks: i64,
}

#[derive(Debug, Serialize, TS)]
pub struct ProjectBoard {
    #[serde(flatten)]
    #[ts(flatten)]
    pub project: Project,
    pub columns: Vec<KanbanColumn>,
    pub tasks: Vec<Task>,
    pub dependencies: Vec<DependencyEdge>,
}

/// Create a project with its default kanban columns; when a repository is
/// supplied the workspace is cloned inline, with failures surfaced as
/// warnings in the response rather than errors.
pub async fn create_project(
    State(deployment): State<Deployment>,
    Json(payload): Json<CreateProject>,
) -> Result<ResponseJson<ApiResponse<CreatedProject>>, ApiError> {
    let pool = &deployment.db().pool;
    let project_id = Uuid::new_v4();

    let mut tx = pool.begin().await?;
    let project = Project::create(&mut *tx, &payload, project_id).await?;
    for (position, (name, wip_limit, status)) in DEFAULT_COLUMNS.iter().enumerate() {
        KanbanColumn::create(
            &mut *tx,
            project_id,
            &CreateKanbanColumn {
                name: name.to_string(),
                position: Some(position as i32),
                wip_limit: *wip_limit,
                task_statuses: vec![status.to_string()],
            },
            position as i32,
        )
        .await?;
    }
    tx.commit().await?;

    let repo_setup = match &project.repository {
        Some(repo_url) => Some(
            deployment
                .workspaces()
                .setup_project(project_id, repo_url, None)
                .await,
        ),
        None => None,
    };

    deployment
        .events()
        .publish_global(
            "PROJECT_CREATED",
            json!({ "projectId": project.id, "name": project.name }),
        )
        .await;

    Ok(ResponseJson(ApiResponse::success(CreatedProject {
        project,
        repo_setup,
    })))
}

pub async fn list_projects(
    State(deployment): State<Deployment>,
    Query(query): Query<ProjectListQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<ProjectSummary>>>, ApiError> {
    let pool = &deployment.db().pool;
    let projects = Project::find_all(pool, query.status).await?;

    let mut summaries = Vec::with_capacity(projects.len());
    for project in projects {
        let counts = Project::task_counts(pool, project.id).await?;
        let total_tasks: i64 = counts.iter().map(|(_, n)| n).sum();
        let completed_tasks: i64 = counts
            .iter()
            .filter(|(status, _)| project.semantics().is_done(status))
            .map(|(_, n)| n)
            .sum();
        summaries.push(ProjectSummary {
            project,
            total_tasks,
            completed_tasks,
        });
    }
    Ok(ResponseJson(ApiResponse::success(summaries)))
}

/// Full board state: columns, tasks, and dependency edges.
pub async fn get_project(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<ProjectBoard>>, ApiError> {
    let pool = &deployment.db().pool;
    let columns = KanbanColumn::find_by_project(pool, project.id).await?;
    let tasks = Task::find_by_project(pool, project.id).await?;
    let dependencies = DependencyEdge::find_by_project(pool, project.id).await?;
    Ok(ResponseJson(ApiResponse::success(ProjectBoard {
        project,
        columns,
        tasks,
        dependencies,
    })))
}

pub async fn update_project(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Json(payload): Json<UpdateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let updated = Project::update(&deployment.db().pool, project.id, &payload).await?;
    deployment
        .events()
        .publish_global("PROJECT_UPDATED", json!({ "projectId": project.id }))
        .await;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

/// Permanent delete; columns, tasks, edges, and policies cascade.
pub async fn delete_project(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    Project::delete(&deployment.db().pool, project.id).await?;
    deployment
        .events()
        .publish_global("PROJECT_DELETED", json!({ "projectId": project.id }))
        .await;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn archive_project(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    Project::set_status(&deployment.db().pool, project.id, ProjectStatus::Archived).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let project_id_router = Router::new()
        .route(
            "/",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/archive", post(archive_project))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    let inner = Router::new()
        .route("/", get(list_projects).post(create_project))
        .nest("/{project_id}", project_id_router);

    Router::new().nest("/projects", inner)
}
