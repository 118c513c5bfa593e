use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Audit row recorded for every delivered agent wake. The rolling 24-hour
/// guardrail counters are computed from this table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AgentWake {
    pub id: Uuid,
    pub agent_id: String,
    pub source_agent: Option<String>,
    pub triggered_at: DateTime<Utc>,
}

impl AgentWake {
    pub async fn record(
        pool: &PgPool,
        agent_id: &str,
        source_agent: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO agent_wakes (id, agent_id, source_agent) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(agent_id)
            .bind(source_agent)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn last_wake_at(
        pool: &PgPool,
        agent_id: &str,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(triggered_at) FROM agent_wakes WHERE agent_id = $1",
        )
        .bind(agent_id)
        .fetch_one(pool)
        .await
    }

    pub async fn count_last_24h(pool: &PgPool, agent_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM agent_wakes
             WHERE agent_id = $1 AND triggered_at > NOW() - INTERVAL '24 hours'",
        )
        .bind(agent_id)
        .fetch_one(pool)
        .await
    }

    pub async fn count_pair_last_24h(
        pool: &PgPool,
        source_agent: &str,
        agent_id: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM agent_wakes
             WHERE agent_id = $1 AND source_agent = $2
               AND triggered_at > NOW() - INTERVAL '24 hours'",
        )
        .bind(agent_id)
        .bind(source_agent)
        .fetch_one(pool)
        .await
    }
}
