use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::get,
};
use utils::response::ApiResponse;
use uuid::Uuid;

use db::models::{
    kanban_column::{CreateKanbanColumn, KanbanColumn, UpdateKanbanColumn},
    project::Project,
};

use crate::{Deployment, error::ApiError, middleware::load_project_middleware};

pub async fn get_project_columns(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<Vec<KanbanColumn>>>, ApiError> {
    let columns = KanbanColumn::find_by_project(&deployment.db().pool, project.id).await?;
    Ok(ResponseJson(ApiResponse::success(columns)))
}

pub async fn create_column(
    Extension(project): Extension<Project>,
    State(deployment): State<Deployment>,
    Json(payload): Json<CreateKanbanColumn>,
) -> Result<ResponseJson<ApiResponse<KanbanColumn>>, ApiError> {
    let pool = &deployment.db().pool;
    let position = match payload.position {
        Some(position) => position,
        None => KanbanColumn::max_position(pool, project.id).await? + 1,
    };
    let column = KanbanColumn::create(pool, project.id, &payload, position).await?;
    Ok(ResponseJson(ApiResponse::success(column)))
}

pub async fn update_column(
    Extension(project): Extension<Project>,
    Path((_, column_id)): Path<(Uuid, Uuid)>,
    State(deployment): State<Deployment>,
    Json(payload): Json<UpdateKanbanColumn>,
) -> Result<ResponseJson<ApiResponse<KanbanColumn>>, ApiError> {
    let pool = &deployment.db().pool;
    let column = KanbanColumn::find_by_id(pool, column_id)
        .await?
        .filter(|c| c.project_id == project.id)
        .ok_or_else(|| ApiError::NotFound(format!("Column {column_id} not found")))?;
    let updated = KanbanColumn::update(pool, column.id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

/// Delete fails while any task still sits in the column; callers must move
/// tasks first.
pub async fn delete_column(
    Extension(project): Extension<Project>,
    Path((_, column_id)): Path<(Uuid, Uuid)>,
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let pool = &deployment.db().pool;
    let column = KanbanColumn::find_by_id(pool, column_id)
        .await?
        .filter(|c| c.project_id == project.id)
        .ok_or_else(|| ApiError::NotFound(format!("Column {column_id} not found")))?;

    let occupied = KanbanColumn::task_count(pool, column.id).await?;
    if occupied > 0 {
        return Err(ApiError::BadRequest(format!(
            "Cannot delete column with {occupied} tasks. Move them first."
        )));
    }

    KanbanColumn::delete(pool, column.id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router(deployment: &Deployment) -> Router<Deployment> {
    let columns_router = Router::new()
        .route("/", get(get_project_columns).post(create_column))
        .route("/{column_id}", axum::routing::put(update_column).delete(delete_column))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_project_middleware,
        ));

    Router::new().nest("/projects/{project_id}/columns", columns_router)
}
