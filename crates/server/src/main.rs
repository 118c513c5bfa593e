use std::env;

use tracing_subscriber::EnvFilter;

mod deployment;
mod error;
mod middleware;
mod routes;

pub use deployment::Deployment;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let deployment = Deployment::new().await?;

    // Periodic pulses wake every configured agent; the list is data, not code.
    let pulse_agents: Vec<String> = env::var("PULSE_AGENTS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if !pulse_agents.is_empty() {
        deployment.pulse().clone().spawn(pulse_agents);
    }

    let addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {addr}");
    axum::serve(listener, routes::router(deployment)).await?;
    Ok(())
}
