use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use services::services::{
    dispatch::DispatchError, github::GitHubServiceError, swarm::SwarmError,
    workspace::WorkspaceError,
};
use utils::response::ApiResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Workspace(err) => match err {
                WorkspaceError::NoRepository => StatusCode::BAD_REQUEST,
                WorkspaceError::NoPullRequest => StatusCode::NOT_FOUND,
                WorkspaceError::WorktreeTimeout => StatusCode::GATEWAY_TIMEOUT,
                WorkspaceError::GitHub(gh) => github_status(gh),
                WorkspaceError::Sqlx(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Dispatch(err) => match err {
                DispatchError::RunNotFound | DispatchError::StepNotFound => StatusCode::NOT_FOUND,
                DispatchError::PipelineNotFound(_) => StatusCode::NOT_FOUND,
                DispatchError::NoPipeline => StatusCode::BAD_REQUEST,
                DispatchError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Swarm(err) => match err {
                SwarmError::TaskNotFound(_) => StatusCode::NOT_FOUND,
                SwarmError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
            ApiError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn github_status(err: &GitHubServiceError) -> StatusCode {
    match err {
        GitHubServiceError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        GitHubServiceError::NotConfigured => StatusCode::BAD_REQUEST,
        GitHubServiceError::Network(_) => StatusCode::BAD_GATEWAY,
        GitHubServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        GitHubServiceError::Rejected(_) => StatusCode::CONFLICT,
        GitHubServiceError::UnexpectedResponse(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {self}");
        }
        (status, Json(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}
