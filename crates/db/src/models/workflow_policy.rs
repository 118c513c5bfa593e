use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, types::Json};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StageDisposition {
    #[default]
    Run,
    Skip,
}

/// One entry of a work type's ordered stage list.
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq)]
pub struct StageRule {
    pub stage: String,
    pub disposition: StageDisposition,
    pub agent_role: Option<String>,
}

pub type StageRules = HashMap<String, Vec<StageRule>>;

/// Per-project mapping from work_type to its stage pipeline. Validates
/// transitions and selects the agent role to wake after each stage.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct WorkflowPolicy {
    pub project_id: Uuid,
    #[ts(type = "Record<string, Array<StageRule>>")]
    pub stage_rules: Json<StageRules>,
}

/// Map a raw status to the workflow stage it belongs to. Statuses outside
/// any stage (backlog, ready, blocked, terminal) return None and are never
/// policy-gated.
pub fn stage_for_status(status: &str) -> Option<&'static str> {
    match status {
        "planning" | "planned" => Some("architecture"),
        "ux" => Some("ux"),
        "in_progress" => Some("implementation"),
        "review" => Some("review"),
        "test" => Some("qa"),
        _ => None,
    }
}

/// Stages still open for a task: rules with disposition=run whose stage has
/// not been completed yet, in policy order.
pub fn next_valid_stages(
    rules: &[StageRule],
    completed_stages: &[String],
) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.disposition == StageDisposition::Run)
        .filter(|r| !completed_stages.iter().any(|c| c == &r.stage))
        .map(|r| r.stage.clone())
        .collect()
}

impl WorkflowPolicy {
    pub fn rules_for(&self, work_type: &str) -> Option<&Vec<StageRule>> {
        self.stage_rules.0.get(work_type)
    }

    /// The rule governing a target stage for a work type, if any.
    pub fn rule_for_stage(&self, work_type: &str, stage: &str) -> Option<&StageRule> {
        self.rules_for(work_type)
            .and_then(|rules| rules.iter().find(|r| r.stage == stage))
    }

    pub async fn find_by_project(
        pool: &PgPool,
        project_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowPolicy>(
            "SELECT project_id, stage_rules FROM workflow_policies WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn upsert(
        pool: &PgPool,
        project_id: Uuid,
        stage_rules: &StageRules,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, WorkflowPolicy>(
            "INSERT INTO workflow_policies (project_id, stage_rules)
             VALUES ($1, $2)
             ON CONFLICT (project_id) DO UPDATE SET stage_rules = EXCLUDED.stage_rules
             RETURNING project_id, stage_rules",
        )
        .bind(project_id)
        .bind(Json(stage_rules.clone()))
        .fetch_one(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(stage: &str, disposition: StageDisposition, role: Option<&str>) -> StageRule {
        StageRule {
            stage: stage.to_string(),
            disposition,
            agent_role: role.map(String::from),
        }
    }

    #[test]
    fn stage_mapping_covers_workflow_statuses_only() {
        assert_eq!(stage_for_status("planning"), Some("architecture"));
        assert_eq!(stage_for_status("in_progress"), Some("implementation"));
        assert_eq!(stage_for_status("test"), Some("qa"));
        assert_eq!(stage_for_status("backlog"), None);
        assert_eq!(stage_for_status("done"), None);
        assert_eq!(stage_for_status("blocked"), None);
    }

    #[test]
    fn next_valid_stages_skips_completed_and_skipped() {
        let rules = vec![
            rule("architecture", StageDisposition::Run, Some("sa")),
            rule("ux", StageDisposition::Skip, Some("ux")),
            rule("implementation", StageDisposition::Run, Some("swe")),
            rule("qa", StageDisposition::Run, Some("qa")),
        ];
        let next = next_valid_stages(&rules, &["architecture".to_string()]);
        assert_eq!(next, vec!["implementation".to_string(), "qa".to_string()]);
    }

    #[test]
    fn rule_lookup_by_stage() {
        let mut rules = StageRules::new();
        rules.insert(
            "bugfix".to_string(),
            vec![
                rule("implementation", StageDisposition::Run, Some("swe")),
                rule("ux", StageDisposition::Skip, None),
            ],
        );
        let policy = WorkflowPolicy {
            project_id: Uuid::new_v4(),
            stage_rules: Json(rules),
        };
        assert_eq!(
            policy.rule_for_stage("bugfix", "ux").unwrap().disposition,
            StageDisposition::Skip
        );
        assert!(policy.rule_for_stage("feature", "ux").is_none());
    }
}
