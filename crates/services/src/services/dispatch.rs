use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use db::{
    DBService,
    models::{
        kanban_column::KanbanColumn,
        project::Project,
        run::{CreateRun, Run, RunStatus},
        step::{CreateStep, Step, StepStatus},
        task::Task,
        task_run::TaskRun,
    },
};

use crate::services::{events::EventService, readiness::ReadinessPropagator};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("Run not found")]
    RunNotFound,
    #[error("Step not found")]
    StepNotFound,
    #[error("Pipeline '{0}' not found")]
    PipelineNotFound(String),
    #[error("No pipeline assigned. Set a default pipeline for this project or select one when executing.")]
    NoPipeline,
}

/// Pipeline definitions live in an external registry referenced by id only.
/// Until the registry ships every id validates.
pub fn validate_pipeline_exists(_pipeline_id: &str) -> bool {
    true
}

/// Pipeline selection priority for task execution: explicit request override,
/// then the task's own pipeline, then the project default.
pub fn resolve_pipeline(
    request_override: Option<&str>,
    task_pipeline: Option<&str>,
    project_default: Option<&str>,
) -> Option<String> {
    request_override
        .or(task_pipeline)
        .or(project_default)
        .map(String::from)
}

/// Translates "start a pipeline run" intents into persistent state and a
/// signal on the `new_runs` stream, and folds worker completions back into
/// task state.
#[derive(Clone)]
pub struct RunDispatcher {
    db: DBService,
    events: EventService,
    readiness: ReadinessPropagator,
}

impl RunDispatcher {
    pub fn new(db: DBService, events: EventService, readiness: ReadinessPropagator) -> Self {
        Self { db, events, readiness }
    }

    fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    /// Create a pending run and signal the worker pool. The workspace type is
    /// inherited from the project when the run is project-linked.
    pub async fn start_run(&self, mut data: CreateRun) -> Result<Run, DispatchError> {
        if !validate_pipeline_exists(&data.pipeline_id) {
            return Err(DispatchError::PipelineNotFound(data.pipeline_id));
        }

        if data.workspace_type.is_none()
            && let Some(project_id) = data.project_id
            && let Some(project) = Project::find_by_id(self.pool(), project_id).await?
        {
            data.workspace_type = Some(project.workspace_type);
        }

        let run = Run::create(self.pool(), Uuid::new_v4(), &data).await?;
        self.signal_new_run(&run).await;
        Ok(run)
    }

    async fn signal_new_run(&self, run: &Run) {
        self.events.publish_new_run(run.id, &run.pipeline_id).await;
        let active = Run::count_running(self.pool()).await.unwrap_or(0);
        self.events
            .publish_global(
                "RUN_CREATED",
                json!({
                    "runId": run.id,
                    "pipelineId": run.pipeline_id,
                    "taskDescription": run.task_description,
                    "activeRuns": active,
                }),
            )
            .await;
    }

    /// Start a pipeline run for a task: create the run, link it to the task,
    /// move the task into execution, and record the task_runs history row,
    /// all in one transaction, then signal workers.
    pub async fn execute_task(
        &self,
        project: &Project,
        task: &Task,
        pipeline_id: &str,
        context: Option<&str>,
        initiated_by_user_id: Option<String>,
        model_override: Option<String>,
    ) -> Result<Run, DispatchError> {
        if !validate_pipeline_exists(pipeline_id) {
            return Err(DispatchError::PipelineNotFound(pipeline_id.to_string()));
        }

        let mut task_description = format!(
            "[Project: {}] [Task: {}]\n\n{}",
            project.id, task.title, task.description
        );
        if let Some(context) = context {
            task_description.push_str(&format!("\n\nAdditional context:\n{context}"));
        }

        let in_progress_col =
            KanbanColumn::find_for_status(self.pool(), project.id, "in_progress").await?;

        let run_id = Uuid::new_v4();
        let mut tx = self.pool().begin().await?;
        let run = Run::create(
            &mut *tx,
            run_id,
            &CreateRun {
                pipeline_id: pipeline_id.to_string(),
                task_description,
                project_id: Some(project.id),
                human_context: context.map(String::from),
                initiated_by_user_id,
                model_override,
                task_branch: task.metadata().git_branch.clone(),
                workspace_type: Some(project.workspace_type),
            },
        )
        .await?;
        Task::start_run(
            &mut *tx,
            task.id,
            run.id,
            pipeline_id,
            "in_progress",
            in_progress_col.map(|c| c.id),
        )
        .await?;
        TaskRun::create(&mut *tx, task.id, run.id, pipeline_id, "running").await?;
        tx.commit().await?;

        self.events.publish_new_run(run.id, pipeline_id).await;
        self.events
            .publish_global(
                "TASK_EXECUTION_STARTED",
                json!({
                    "projectId": project.id,
                    "taskId": task.id,
                    "runId": run.id,
                    "pipelineId": pipeline_id,
                }),
            )
            .await;
        Ok(run)
    }

    /// Worker webhook: a run linked to a task completed or failed. Maps the
    /// run status onto the project's semantics, settles the task and history
    /// row, then fans out the readiness cascade.
    ///
    /// Returns the task's new status, or None when the run status isn't
    /// terminal (the webhook ignores those).
    pub async fn run_completed(
        &self,
        project: &Project,
        task: &Task,
        run_id: Uuid,
        run_status: &str,
    ) -> Result<Option<String>, DispatchError> {
        let semantics = project.semantics();
        let new_status = match run_status {
            "completed" => semantics.first_done().to_string(),
            "failed" => semantics.first_fail().to_string(),
            _ => return Ok(None),
        };
        let completed = semantics.is_done(&new_status);

        let target_col =
            KanbanColumn::find_for_status(self.pool(), project.id, &new_status).await?;

        let mut tx = self.pool().begin().await?;
        Task::finish_run(
            &mut *tx,
            task.id,
            &new_status,
            target_col.map(|c| c.id),
            completed,
        )
        .await?;
        TaskRun::complete(&mut *tx, task.id, run_id, run_status).await?;
        tx.commit().await?;

        self.readiness.propagate(project, task.id, &new_status).await;

        let event_type = if completed {
            "TASK_EXECUTION_COMPLETED"
        } else {
            "TASK_EXECUTION_FAILED"
        };
        self.events
            .publish_global(
                event_type,
                json!({
                    "projectId": project.id,
                    "taskId": task.id,
                    "runId": run_id,
                    "status": new_status,
                }),
            )
            .await;

        Ok(Some(new_status))
    }

    /// Upsert a step by (run_id, step_id); an existing row is reset for retry.
    pub async fn create_step(&self, run_id: Uuid, data: &CreateStep) -> Result<Step, DispatchError> {
        Run::find_by_id(self.pool(), run_id)
            .await?
            .ok_or(DispatchError::RunNotFound)?;
        Ok(Step::upsert(self.pool(), run_id, data).await?)
    }

    pub async fn update_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        data: &db::models::step::UpdateStep,
    ) -> Result<Step, DispatchError> {
        let step = Step::update(self.pool(), run_id, step_id, data).await?;
        self.events
            .publish_run_event(
                run_id,
                "STEP_UPDATED",
                json!({
                    "stepId": step_id,
                    "status": step.status.to_string(),
                }),
            )
            .await;
        Ok(step)
    }

    /// Reset a step to pending and bring the run back to running, even from
    /// completed/failed. Re-posts to `new_runs` because a finished run's
    /// subscription has been torn down; the signal tells the engine to
    /// re-subscribe and pick up the pending step.
    pub async fn restart_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        context: Option<&str>,
    ) -> Result<Run, DispatchError> {
        let run = Run::find_by_id(self.pool(), run_id)
            .await?
            .ok_or(DispatchError::RunNotFound)?;

        let mut tx = self.pool().begin().await?;
        let reset = Step::reset(&mut *tx, run_id, step_id, context).await?;
        if reset == 0 {
            return Err(DispatchError::StepNotFound);
        }
        Run::set_status(&mut *tx, run_id, RunStatus::Running, false).await?;
        tx.commit().await?;

        self.events
            .publish_run_event(
                run_id,
                "HUMAN_INTERVENTION",
                json!({
                    "stepId": step_id,
                    "action": "restart",
                    "context": context.unwrap_or(""),
                }),
            )
            .await;
        self.events.publish_new_run(run_id, &run.pipeline_id).await;

        Ok(Run::find_by_id(self.pool(), run_id)
            .await?
            .ok_or(DispatchError::RunNotFound)?)
    }

    /// Reset every step and restart the run from scratch.
    pub async fn restart_run(&self, run_id: Uuid, context: Option<&str>) -> Result<Run, DispatchError> {
        let run = Run::find_by_id(self.pool(), run_id)
            .await?
            .ok_or(DispatchError::RunNotFound)?;

        let mut tx = self.pool().begin().await?;
        Step::reset_all(&mut *tx, run_id, context).await?;
        Run::set_status(&mut *tx, run_id, RunStatus::Pending, false).await?;
        tx.commit().await?;

        self.events
            .publish_run_event(
                run_id,
                "RUN_CREATED",
                json!({
                    "pipelineId": run.pipeline_id,
                    "task": run.task_description,
                }),
            )
            .await;
        self.events.publish_new_run(run_id, &run.pipeline_id).await;

        Ok(Run::find_by_id(self.pool(), run_id)
            .await?
            .ok_or(DispatchError::RunNotFound)?)
    }

    pub async fn pause_run(&self, run_id: Uuid) -> Result<(), DispatchError> {
        let run = Run::find_by_id(self.pool(), run_id)
            .await?
            .ok_or(DispatchError::RunNotFound)?;
        Run::set_status(self.pool(), run_id, RunStatus::Paused, false).await?;

        self.events
            .publish_run_event(
                run_id,
                "HUMAN_INTERVENTION",
                json!({
                    "stepId": run.current_step_id.unwrap_or_default(),
                    "action": "stop",
                    "context": "Paused via API",
                }),
            )
            .await;
        self.publish_run_status(run_id, "paused").await;
        Ok(())
    }

    /// Resume a paused run, re-emitting STEP_QUEUED for each step that was
    /// queued when the run paused.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<usize, DispatchError> {
        Run::find_by_id(self.pool(), run_id)
            .await?
            .ok_or(DispatchError::RunNotFound)?;
        let queued = Step::find_by_run(self.pool(), run_id, Some(StepStatus::Queued)).await?;
        Run::set_status(self.pool(), run_id, RunStatus::Running, false).await?;

        for step in &queued {
            self.events
                .publish_run_event(
                    run_id,
                    "STEP_QUEUED",
                    json!({
                        "stepId": step.step_id,
                        "agentId": step.agent_id,
                    }),
                )
                .await;
        }
        self.publish_run_status(run_id, "running").await;
        Ok(queued.len())
    }

    /// Cancel never blocks the caller: state is committed, the intervention
    /// event is published, and workers react asynchronously.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), DispatchError> {
        let run = Run::find_by_id(self.pool(), run_id)
            .await?
            .ok_or(DispatchError::RunNotFound)?;
        Run::set_status(self.pool(), run_id, RunStatus::Cancelled, true).await?;

        self.events
            .publish_run_event(
                run_id,
                "HUMAN_INTERVENTION",
                json!({
                    "stepId": run.current_step_id.unwrap_or_default(),
                    "action": "stop",
                    "context": "Cancelled via API",
                }),
            )
            .await;
        self.publish_run_status(run_id, "cancelled").await;
        Ok(())
    }

    async fn publish_run_status(&self, run_id: Uuid, status: &str) {
        let active = Run::count_running(self.pool()).await.unwrap_or(0);
        self.events
            .publish_global(
                "RUN_STATUS_CHANGED",
                json!({
                    "runId": run_id,
                    "status": status,
                    "activeRuns": active,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_resolution_priority() {
        assert_eq!(
            resolve_pipeline(Some("override"), Some("task"), Some("default")),
            Some("override".to_string())
        );
        assert_eq!(
            resolve_pipeline(None, Some("task"), Some("default")),
            Some("task".to_string())
        );
        assert_eq!(
            resolve_pipeline(None, None, Some("default")),
            Some("default".to_string())
        );
        assert_eq!(resolve_pipeline(None, None, None), None);
    }
}
