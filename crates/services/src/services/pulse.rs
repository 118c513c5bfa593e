use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio::time::interval;

use db::{
    DBService,
    models::{
        agent_wake::AgentWake,
        global_settings::{GlobalSettings, PulseSettings},
    },
};

use crate::services::events::EventService;

/// Legacy transition triggers used when no workflow policy names an agent.
/// Kept only as defaults; remove once projects uniformly carry policies.
const LEGACY_TRANSITION_TRIGGERS: &[(&str, &str)] = &[
    ("planned", "shigeo"),
    ("test", "chieko"),
    ("failed", "yukihiro"),
];

/// Role → agent id mapping. Data in spirit, hardcoded until a per-project
/// agent directory exists.
const ROLE_TO_AGENT: &[(&str, &str)] = &[
    ("po", "eric"),
    ("sa", "finn"),
    ("ux", "shigeo"),
    ("swe", "yukihiro"),
    ("qa", "chieko"),
    ("sre", "stas"),
];

pub fn agent_for_role(role: &str) -> Option<&'static str> {
    ROLE_TO_AGENT
        .iter()
        .find(|(r, _)| *r == role)
        .map(|(_, agent)| *agent)
}

pub fn legacy_agent_for_status(status: &str) -> Option<&'static str> {
    LEGACY_TRANSITION_TRIGGERS
        .iter()
        .find(|(s, _)| *s == status)
        .map(|(_, agent)| *agent)
}

/// Why a wake was suppressed. Suppression is silent: logged, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    Disabled,
    Cooldown,
    DailyCap,
    PairCap,
    ConcurrencyCap,
}

/// Guardrail evaluation, separated from I/O so the rules are testable.
pub fn evaluate_guardrails(
    settings: &PulseSettings,
    now: DateTime<Utc>,
    last_wake: Option<DateTime<Utc>>,
    wakes_last_24h: i64,
    pair_wakes_last_24h: Option<i64>,
    active_sessions: usize,
) -> Result<(), Suppressed> {
    if !settings.wake_enabled {
        return Err(Suppressed::Disabled);
    }
    if let Some(last) = last_wake
        && (now - last).num_seconds() < settings.wake_cooldown_sec
    {
        return Err(Suppressed::Cooldown);
    }
    if wakes_last_24h >= settings.max_wakes_per_day {
        return Err(Suppressed::DailyCap);
    }
    if let Some(pair_count) = pair_wakes_last_24h
        && pair_count >= settings.max_wakes_per_pair_per_day
    {
        return Err(Suppressed::PairCap);
    }
    if active_sessions >= settings.max_concurrent_pulse_sessions {
        return Err(Suppressed::ConcurrencyCap);
    }
    Ok(())
}

/// Wakes agents periodically and in response to transitions, within the
/// configured guardrails. Settings are read from the database on every
/// evaluation (no cache) so horizontally scaled instances agree.
#[derive(Clone)]
pub struct PulseScheduler {
    db: DBService,
    events: EventService,
    active_sessions: Arc<AtomicUsize>,
}

impl PulseScheduler {
    pub fn new(db: DBService, events: EventService) -> Self {
        Self {
            db,
            events,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    /// Called by the session runner when a pulse session starts/ends, so the
    /// concurrency guardrail reflects live sessions.
    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn session_finished(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Periodic wake loop: every pulse interval, trigger every enabled agent.
    pub fn spawn(self, agents: Vec<String>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let settings = GlobalSettings::pulse_settings(self.pool())
                .await
                .unwrap_or_default();
            tracing::info!(
                "Starting pulse scheduler with interval {} min for {} agents",
                settings.pulse_interval_minutes,
                agents.len()
            );
            let mut ticker = interval(Duration::from_secs(settings.pulse_interval_minutes * 60));
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                for agent_id in &agents {
                    if let Err(e) = self.trigger(agent_id, None, "scheduled pulse").await {
                        tracing::error!("Pulse trigger failed for {agent_id}: {e}");
                    }
                }
            }
        })
    }

    /// Wake one agent, subject to guardrails. Returns whether the wake was
    /// delivered; suppression is not an error.
    pub async fn trigger(
        &self,
        agent_id: &str,
        source_agent: Option<&str>,
        context: &str,
    ) -> Result<bool, sqlx::Error> {
        let settings = GlobalSettings::pulse_settings(self.pool()).await?;
        let last_wake = AgentWake::last_wake_at(self.pool(), agent_id).await?;
        let wakes_24h = AgentWake::count_last_24h(self.pool(), agent_id).await?;
        let pair_24h = match source_agent {
            Some(source) => {
                Some(AgentWake::count_pair_last_24h(self.pool(), source, agent_id).await?)
            }
            None => None,
        };

        if let Err(reason) = evaluate_guardrails(
            &settings,
            Utc::now(),
            last_wake,
            wakes_24h,
            pair_24h,
            self.active_sessions.load(Ordering::SeqCst),
        ) {
            tracing::info!("Suppressed wake for {agent_id} ({reason:?})");
            return Ok(false);
        }

        AgentWake::record(self.pool(), agent_id, source_agent).await?;
        self.events
            .publish_global(
                "PULSE_TRIGGERED",
                json!({
                    "agentId": agent_id,
                    "source": source_agent.unwrap_or("scheduler"),
                    "context": context,
                }),
            )
            .await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn settings() -> PulseSettings {
        PulseSettings::default()
    }

    #[test]
    fn wake_allowed_under_defaults() {
        assert_eq!(
            evaluate_guardrails(&settings(), Utc::now(), None, 0, None, 0),
            Ok(())
        );
    }

    #[test]
    fn master_switch_suppresses_everything() {
        let s = PulseSettings {
            wake_enabled: false,
            ..settings()
        };
        assert_eq!(
            evaluate_guardrails(&s, Utc::now(), None, 0, None, 0),
            Err(Suppressed::Disabled)
        );
    }

    #[test]
    fn cooldown_applies_between_wakes() {
        let now = Utc::now();
        let recent = now - TimeDelta::seconds(60);
        assert_eq!(
            evaluate_guardrails(&settings(), now, Some(recent), 1, None, 0),
            Err(Suppressed::Cooldown)
        );
        let old = now - TimeDelta::seconds(301);
        assert_eq!(
            evaluate_guardrails(&settings(), now, Some(old), 1, None, 0),
            Ok(())
        );
    }

    #[test]
    fn daily_cap_is_rolling() {
        assert_eq!(
            evaluate_guardrails(&settings(), Utc::now(), None, 12, None, 0),
            Err(Suppressed::DailyCap)
        );
    }

    #[test]
    fn pair_cap_only_checked_with_source() {
        assert_eq!(
            evaluate_guardrails(&settings(), Utc::now(), None, 0, Some(5), 0),
            Err(Suppressed::PairCap)
        );
        assert_eq!(
            evaluate_guardrails(&settings(), Utc::now(), None, 0, None, 0),
            Ok(())
        );
    }

    #[test]
    fn concurrency_cap() {
        assert_eq!(
            evaluate_guardrails(&settings(), Utc::now(), None, 0, None, 2),
            Err(Suppressed::ConcurrencyCap)
        );
    }

    #[test]
    fn role_and_legacy_lookups() {
        assert_eq!(agent_for_role("qa"), Some("chieko"));
        assert_eq!(agent_for_role("cfo"), None);
        assert_eq!(legacy_agent_for_status("planned"), Some("shigeo"));
        assert_eq!(legacy_agent_for_status("ready"), None);
    }
}
