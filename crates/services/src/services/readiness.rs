use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use db::{
    DBService,
    models::{
        dependency_edge::DependencyEdge,
        kanban_column::KanbanColumn,
        project::{Project, StatusSemantics},
        task::Task,
    },
};

use crate::services::events::EventService;

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Statuses that count as actively being worked for parent derivation.
const ACTIVE_STATUSES: &[&str] = &["in_progress", "review", "test"];

/// What a blocked dependent should be restored to once its blockers resolve.
/// Prefers the conventional "ready" status when the project maps it as
/// claimable, otherwise the first claimable status.
fn restore_target(semantics: &StatusSemantics) -> &str {
    if semantics.claimable.iter().any(|s| s == "ready") {
        "ready"
    } else {
        semantics.first_claimable()
    }
}

/// Where a blocked dependent should go when one of its blockers leaves a
/// failed/blocked state, based on the statuses of all its blocking
/// predecessors. None while any predecessor is itself still failed or
/// blocked. Otherwise the claimable restore target when every predecessor
/// is done, or the first initial status while some are still pending. A
/// saved pre-block status takes precedence over this fallback.
pub fn recovery_status<'a>(
    predecessor_statuses: &[String],
    semantics: &'a StatusSemantics,
) -> Option<&'a str> {
    let stuck = predecessor_statuses
        .iter()
        .any(|s| semantics.is_fail(s) || semantics.is_blocked(s));
    if stuck {
        return None;
    }
    let all_done = predecessor_statuses.iter().all(|s| semantics.is_done(s));
    Some(if all_done {
        restore_target(semantics)
    } else {
        semantics.first_initial()
    })
}

/// Derive a parent's status from the multiset of its subtask statuses.
/// Returns None when the parent should stay as-is. The rules are idempotent:
/// feeding the derived status back in yields the same answer.
pub fn derive_parent_status(
    sibling_statuses: &[String],
    semantics: &StatusSemantics,
) -> Option<&'static str> {
    if sibling_statuses.is_empty() {
        return None;
    }
    let all_done = sibling_statuses.iter().all(|s| semantics.is_done(s));
    let any_active = sibling_statuses
        .iter()
        .any(|s| ACTIVE_STATUSES.contains(&s.as_str()));
    let any_failed = sibling_statuses.iter().any(|s| semantics.is_fail(s));

    if all_done {
        Some("done")
    } else if any_active {
        Some("in_progress")
    } else if any_failed {
        Some("failed")
    } else {
        None
    }
}

/// Cross-cutting readiness rules fired whenever a task's status changes.
///
/// The cascade is eventually consistent: concurrent transitions may trigger
/// overlapping recomputations, and the final state is independent of order.
/// Errors here are logged and never abort the originating transition;
/// partial cascades self-heal on the next transition.
#[derive(Clone)]
pub struct ReadinessPropagator {
    db: DBService,
    events: EventService,
}

impl ReadinessPropagator {
    pub fn new(db: DBService, events: EventService) -> Self {
        Self { db, events }
    }

    fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    /// Entry point used by transition and run-completion paths. Swallows
    /// errors by design.
    pub async fn propagate(&self, project: &Project, changed_task_id: Uuid, new_status: &str) {
        if let Err(e) = self.recompute(project, changed_task_id, new_status).await {
            tracing::error!(
                "Readiness cascade failed for task {changed_task_id} ({new_status}): {e}"
            );
        }
    }

    async fn recompute(
        &self,
        project: &Project,
        changed_task_id: Uuid,
        new_status: &str,
    ) -> Result<(), ReadinessError> {
        let semantics = project.semantics();

        if semantics.is_done(new_status) {
            self.unblock_dependents(project, changed_task_id, semantics)
                .await?;
        } else if semantics.is_fail(new_status) {
            self.block_downstream(project, changed_task_id, semantics)
                .await?;
        } else if !semantics.is_blocked(new_status) {
            // Recovery: the task moved out of a failed/blocked state.
            self.restore_blocked_dependents(project, changed_task_id, semantics)
                .await?;
        }
        Ok(())
    }

    /// The changed task reached terminal-done: every direct dependent whose
    /// blocking predecessors are now all done gets restored to its pre-block
    /// state, or to the claimable default.
    async fn unblock_dependents(
        &self,
        project: &Project,
        changed_task_id: Uuid,
        semantics: &StatusSemantics,
    ) -> Result<(), ReadinessError> {
        let dependent_ids =
            DependencyEdge::blocked_dependent_ids(self.pool(), project.id, changed_task_id).await?;

        for dep_id in dependent_ids {
            let preds = DependencyEdge::blocking_predecessors(self.pool(), dep_id).await?;
            if !preds.iter().all(|p| semantics.is_done(&p.status)) {
                continue;
            }
            let Some(task) = Task::find_by_id(self.pool(), dep_id).await? else {
                continue;
            };
            // Only wake tasks still waiting; in-flight or terminal tasks keep
            // their state.
            let waiting = semantics.is_initial(&task.status)
                || semantics.is_blocked(&task.status)
                || matches!(task.status.as_str(), "planning" | "planned" | "ux");
            if !waiting {
                continue;
            }

            let mut meta = task.metadata().clone();
            let restore_status = meta
                .pre_block_status
                .take()
                .unwrap_or_else(|| restore_target(semantics).to_string());
            let restore_column_id = meta.pre_block_column_id.take();

            let target_col = match restore_column_id {
                Some(col_id) => KanbanColumn::find_by_id(self.pool(), col_id).await?,
                None => None,
            };
            let target_col = match target_col {
                Some(col) => Some(col),
                None => {
                    KanbanColumn::find_for_status(self.pool(), project.id, &restore_status).await?
                }
            };
            let Some(target_col) = target_col else {
                tracing::warn!(
                    "No column maps status '{restore_status}' in project {}; leaving task {dep_id} untouched",
                    project.id
                );
                continue;
            };

            Task::set_metadata(self.pool(), dep_id, &meta).await?;
            Task::apply_transition(self.pool(), dep_id, &restore_status, target_col.id, false)
                .await?;

            self.events
                .publish_global(
                    "TASK_STATUS_CHANGED",
                    json!({
                        "projectId": project.id,
                        "taskId": dep_id,
                        "status": restore_status,
                        "reason": "all_dependencies_met",
                    }),
                )
                .await;
        }
        Ok(())
    }

    /// The changed task failed: walk the downstream closure via blocks edges
    /// and move every non-terminal task to blocked, remembering where it was.
    async fn block_downstream(
        &self,
        project: &Project,
        changed_task_id: Uuid,
        semantics: &StatusSemantics,
    ) -> Result<(), ReadinessError> {
        // Iterative DFS over the closure.
        let mut to_block: Vec<Uuid> = Vec::new();
        let mut visited: Vec<Uuid> = Vec::new();
        let mut stack = vec![changed_task_id];
        while let Some(current) = stack.pop() {
            let dependents =
                DependencyEdge::blocked_dependent_ids(self.pool(), project.id, current).await?;
            for dep_id in dependents {
                if visited.contains(&dep_id) {
                    continue;
                }
                visited.push(dep_id);
                if let Some(task) = Task::find_by_id(self.pool(), dep_id).await?
                    && !semantics.is_terminal(&task.status)
                {
                    to_block.push(dep_id);
                    stack.push(dep_id);
                }
            }
        }

        if to_block.is_empty() {
            return Ok(());
        }

        let blocked_status = semantics.first_blocked().to_string();
        let columns = KanbanColumn::find_by_project(self.pool(), project.id).await?;
        let blocked_col = columns
            .iter()
            .find(|c| c.maps_status(&blocked_status))
            .or_else(|| {
                columns
                    .iter()
                    .find(|c| c.statuses().iter().any(|s| semantics.is_fail(s)))
            });
        let Some(blocked_col) = blocked_col else {
            tracing::warn!(
                "No blocked or failed column in project {}; cascade skipped",
                project.id
            );
            return Ok(());
        };

        for dep_id in to_block {
            let Some(task) = Task::find_by_id(self.pool(), dep_id).await? else {
                continue;
            };
            let mut meta = task.metadata().clone();
            meta.pre_block_status = Some(task.status.clone());
            meta.pre_block_column_id = Some(task.column_id);
            Task::set_metadata(self.pool(), dep_id, &meta).await?;
            Task::apply_transition(self.pool(), dep_id, &blocked_status, blocked_col.id, false)
                .await?;

            self.events
                .publish_global(
                    "TASK_STATUS_CHANGED",
                    json!({
                        "projectId": project.id,
                        "taskId": dep_id,
                        "status": blocked_status,
                        "reason": "dependency_failed",
                    }),
                )
                .await;
        }
        Ok(())
    }

    /// The changed task recovered (left failed/blocked without reaching a
    /// terminal state): dependents blocked on it are restored to their
    /// pre-block state when no other predecessor is still failed or blocked.
    /// Each restored task is itself a recovery, so the walk continues into
    /// its own blocked dependents until the chain runs dry.
    async fn restore_blocked_dependents(
        &self,
        project: &Project,
        changed_task_id: Uuid,
        semantics: &StatusSemantics,
    ) -> Result<(), ReadinessError> {
        let mut stack = vec![changed_task_id];
        while let Some(current) = stack.pop() {
            let dependent_ids =
                DependencyEdge::blocked_dependent_ids(self.pool(), project.id, current).await?;

            for dep_id in dependent_ids {
                let Some(task) = Task::find_by_id(self.pool(), dep_id).await? else {
                    continue;
                };
                if !semantics.is_blocked(&task.status) {
                    continue;
                }

                let preds = DependencyEdge::blocking_predecessors(self.pool(), dep_id).await?;
                let pred_statuses: Vec<String> =
                    preds.into_iter().map(|p| p.status).collect();
                let Some(fallback) = recovery_status(&pred_statuses, semantics) else {
                    continue;
                };

                let mut meta = task.metadata().clone();
                let new_status = meta
                    .pre_block_status
                    .take()
                    .unwrap_or_else(|| fallback.to_string());
                let restore_column_id = meta.pre_block_column_id.take();

                let target_col = match restore_column_id {
                    Some(col_id) => KanbanColumn::find_by_id(self.pool(), col_id).await?,
                    None => None,
                };
                let target_col = match target_col {
                    Some(col) => Some(col),
                    None => {
                        KanbanColumn::find_for_status(self.pool(), project.id, &new_status)
                            .await?
                    }
                };
                let Some(target_col) = target_col else {
                    continue;
                };

                Task::set_metadata(self.pool(), dep_id, &meta).await?;
                Task::apply_transition(self.pool(), dep_id, &new_status, target_col.id, false)
                    .await?;

                self.events
                    .publish_global(
                        "TASK_STATUS_CHANGED",
                        json!({
                            "projectId": project.id,
                            "taskId": dep_id,
                            "status": new_status,
                            "reason": "dependency_unblocked",
                        }),
                    )
                    .await;

                // The restored task just left blocked, so its own blocked
                // dependents may be eligible now.
                stack.push(dep_id);
            }
        }
        Ok(())
    }

    /// Derive a container parent's status after one of its subtasks changed.
    /// If the parent lands on terminal-done, its own dependents cascade.
    pub async fn recompute_parent(&self, project: &Project, subtask_id: Uuid) {
        if let Err(e) = self.derive_and_apply_parent(project, subtask_id).await {
            tracing::error!("Parent derivation failed for subtask {subtask_id}: {e}");
        }
    }

    async fn derive_and_apply_parent(
        &self,
        project: &Project,
        subtask_id: Uuid,
    ) -> Result<(), ReadinessError> {
        let Some(subtask) = Task::find_by_id(self.pool(), subtask_id).await? else {
            return Ok(());
        };
        let Some(parent_id) = subtask.parent_task_id else {
            return Ok(());
        };

        let siblings = Task::sibling_statuses(self.pool(), parent_id).await?;
        let semantics = project.semantics();
        let Some(derived) = derive_parent_status(&siblings, semantics) else {
            return Ok(());
        };

        let Some(parent) = Task::find_by_id(self.pool(), parent_id).await? else {
            return Ok(());
        };
        if parent.status == derived {
            return Ok(());
        }

        let Some(target_col) =
            KanbanColumn::find_for_status(self.pool(), project.id, derived).await?
        else {
            tracing::warn!(
                "No column found for derived parent status '{derived}' in project {}",
                project.id
            );
            return Ok(());
        };

        let old_status = parent.status.clone();
        let completed = semantics.is_done(derived);
        Task::apply_transition(self.pool(), parent_id, derived, target_col.id, completed).await?;

        tracing::info!(
            "Parent task {parent_id} status derived: {old_status} -> {derived} (subtask {subtask_id} changed)"
        );
        self.events
            .publish_global(
                "TASK_STATUS_CHANGED",
                json!({
                    "projectId": project.id,
                    "taskId": parent_id,
                    "fromStatus": old_status,
                    "toStatus": derived,
                    "reason": "derived_from_subtasks",
                }),
            )
            .await;

        if completed {
            self.propagate(project, parent_id, derived).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_done_derives_done() {
        let s = StatusSemantics::default();
        assert_eq!(
            derive_parent_status(&statuses(&["done", "done", "done"]), &s),
            Some("done")
        );
    }

    #[test]
    fn any_active_derives_in_progress() {
        let s = StatusSemantics::default();
        assert_eq!(
            derive_parent_status(&statuses(&["ready", "in_progress", "ready"]), &s),
            Some("in_progress")
        );
        // Active wins over failed.
        assert_eq!(
            derive_parent_status(&statuses(&["failed", "review"]), &s),
            Some("in_progress")
        );
    }

    #[test]
    fn failed_without_active_derives_failed() {
        let s = StatusSemantics::default();
        assert_eq!(
            derive_parent_status(&statuses(&["failed", "ready"]), &s),
            Some("failed")
        );
    }

    #[test]
    fn quiet_subtasks_leave_parent_alone() {
        let s = StatusSemantics::default();
        assert_eq!(
            derive_parent_status(&statuses(&["backlog", "ready"]), &s),
            None
        );
        assert_eq!(derive_parent_status(&[], &s), None);
    }

    #[test]
    fn derivation_is_idempotent() {
        let s = StatusSemantics::default();
        // Feeding the derived status back as the full multiset reproduces it.
        for multiset in [&["done", "done"][..], &["in_progress", "ready"][..]] {
            let derived = derive_parent_status(&statuses(multiset), &s).unwrap();
            assert_eq!(
                derive_parent_status(&statuses(&[derived]), &s),
                Some(derived)
            );
        }
    }

    #[test]
    fn restore_target_prefers_ready() {
        let s = StatusSemantics::default();
        assert_eq!(restore_target(&s), "ready");

        let custom = StatusSemantics {
            claimable: vec!["triage".into(), "queued".into()],
            ..StatusSemantics::default()
        };
        assert_eq!(restore_target(&custom), "triage");
    }

    #[test]
    fn recovery_blocked_while_any_predecessor_is_stuck() {
        let s = StatusSemantics::default();
        assert_eq!(recovery_status(&statuses(&["failed", "done"]), &s), None);
        assert_eq!(recovery_status(&statuses(&["blocked", "done"]), &s), None);
    }

    #[test]
    fn recovery_with_all_predecessors_done_goes_to_ready() {
        let s = StatusSemantics::default();
        assert_eq!(recovery_status(&statuses(&["done", "done"]), &s), Some("ready"));
        assert_eq!(recovery_status(&[], &s), Some("ready"));
    }

    #[test]
    fn recovery_with_pending_predecessors_falls_back_to_initial() {
        // A blocker moved back to in_progress: its dependent is eligible
        // again, but lands on the initial status unless a pre-block status
        // was saved (which callers restore in preference to this fallback).
        let s = StatusSemantics::default();
        assert_eq!(
            recovery_status(&statuses(&["in_progress"]), &s),
            Some("backlog")
        );
        assert_eq!(
            recovery_status(&statuses(&["done", "ready"]), &s),
            Some("backlog")
        );
    }
}
