use std::env;

use db::DBService;
use services::services::{
    dispatch::RunDispatcher, events::EventService, github::GitHubService, pulse::PulseScheduler,
    readiness::ReadinessPropagator, swarm::SwarmCoordinator, workspace::WorkspaceManager,
};

/// Shared server state: the database handle plus every engine built on it.
#[derive(Clone)]
pub struct Deployment {
    db: DBService,
    events: EventService,
    readiness: ReadinessPropagator,
    dispatcher: RunDispatcher,
    workspaces: WorkspaceManager,
    pulse: PulseScheduler,
    swarm: SwarmCoordinator,
}

impl Deployment {
    pub async fn new() -> anyhow::Result<Self> {
        let db = DBService::new().await?;
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let events = EventService::connect(&redis_url).await;
        let github = GitHubService::new();

        let readiness = ReadinessPropagator::new(db.clone(), events.clone());
        let dispatcher = RunDispatcher::new(db.clone(), events.clone(), readiness.clone());
        let workspaces = WorkspaceManager::new(db.clone(), events.clone(), github);
        let pulse = PulseScheduler::new(db.clone(), events.clone());
        let swarm = SwarmCoordinator::new(db.clone(), events.clone());

        Ok(Self {
            db,
            events,
            readiness,
            dispatcher,
            workspaces,
            pulse,
            swarm,
        })
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn events(&self) -> &EventService {
        &self.events
    }

    pub fn readiness(&self) -> &ReadinessPropagator {
        &self.readiness
    }

    pub fn dispatcher(&self) -> &RunDispatcher {
        &self.dispatcher
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn pulse(&self) -> &PulseScheduler {
        &self.pulse
    }

    pub fn swarm(&self) -> &SwarmCoordinator {
        &self.swarm
    }
}
