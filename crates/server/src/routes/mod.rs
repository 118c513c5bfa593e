use axum::{
    Router,
    routing::{IntoMakeService, get},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::Deployment;

pub mod dependencies;
pub mod execution;
pub mod git_integration;
pub mod health;
pub mod kanban_columns;
pub mod planning;
pub mod projects;
pub mod runs;
pub mod swarm;
pub mod tasks;
pub mod workflow_policies;

pub fn router(deployment: Deployment) -> IntoMakeService<Router> {
    let api_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(projects::router(&deployment))
        .merge(kanban_columns::router(&deployment))
        .merge(tasks::router(&deployment))
        .merge(dependencies::router(&deployment))
        .merge(execution::router(&deployment))
        .merge(planning::router(&deployment))
        .merge(git_integration::router(&deployment))
        .merge(swarm::router(&deployment))
        .merge(workflow_policies::router(&deployment))
        .merge(runs::router(&deployment))
        .with_state(deployment);

    Router::new()
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .into_make_service()
}
