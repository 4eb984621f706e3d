//! Run/step state machine.
//!
//! A run is one session's execution attempt. Its steps advance strictly in
//! order: a step may only reach a terminal status once every lower step is
//! terminal, and a step that does not exist yet may only be created as the
//! next order after the current maximum.

pub mod model;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RunError;
use crate::events::{EventKind, NewAgentEvent};
use crate::store::{CommitOutcome, Database, Mutation};

pub use model::{
    RunOutcome, RunProgress, RunStatus, Run, StartRun, Step, StepOutcome, StepStatus, Workflow,
    ZombieStatus,
};

/// Result of a step advance.
#[derive(Debug, Clone, Serialize)]
pub struct Advanced {
    pub step: Step,
    /// Run status after the advance. A workflow run ends when its final step does.
    pub run_status: RunStatus,
}

#[derive(Clone)]
pub struct RunTracker {
    db: Arc<dyn Database>,
}

impl RunTracker {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    // ── Workflows ───────────────────────────────────────────────────

    /// Define a workflow, or replace the plan of one no run references yet.
    ///
    /// The description may change at any time; the step plan is frozen once
    /// a run references the workflow. Re-registering an identical definition
    /// is a no-op.
    pub async fn register_workflow(
        &self,
        name: &str,
        description: Option<&str>,
        steps: Vec<String>,
    ) -> Result<Workflow, RunError> {
        let description = description.map(str::to_string);
        let Some(existing) = self.db.get_workflow_by_name(name).await? else {
            let workflow = Workflow {
                description,
                ..Workflow::new(name, steps)
            };
            self.db.insert_workflow(&workflow).await?;
            info!(workflow_id = %workflow.id, name, steps = workflow.steps.len(), "Workflow registered");
            return Ok(workflow);
        };

        if existing.steps == steps && existing.description == description {
            return Ok(existing);
        }
        if existing.steps != steps && self.db.workflow_in_use(existing.id).await? {
            return Err(RunError::WorkflowReferenced {
                name: name.to_string(),
            });
        }

        let updated = Workflow {
            description,
            steps,
            updated_at: Utc::now(),
            ..existing
        };
        match self.db.save_workflow(&updated).await? {
            CommitOutcome::Committed => {
                info!(workflow_id = %updated.id, name, version = updated.version + 1, "Workflow definition replaced");
                Ok(Workflow {
                    version: updated.version + 1,
                    ..updated
                })
            }
            CommitOutcome::Stale { .. } => Err(RunError::Stale { id: updated.id }),
        }
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow, RunError> {
        self.db
            .get_workflow(id)
            .await?
            .ok_or(RunError::WorkflowNotFound { id })
    }

    // ── Runs ────────────────────────────────────────────────────────

    /// Start a run for a session key that has no running run.
    ///
    /// Workflow runs get their steps pre-created as `pending`.
    pub async fn start_run(&self, request: StartRun) -> Result<Run, RunError> {
        if self
            .db
            .get_active_run_by_session(&request.session_key)
            .await?
            .is_some()
        {
            return Err(RunError::SessionActive {
                session_key: request.session_key,
            });
        }
        if let Some(task_id) = request.task_id {
            if self.db.get_task(task_id).await?.is_none() {
                return Err(RunError::TaskNotFound { id: task_id });
            }
        }

        let run = Run {
            id: Uuid::new_v4(),
            session_key: request.session_key,
            agent_id: request.agent_id,
            task_id: request.task_id,
            workflow_id: request.workflow_id,
            status: RunStatus::Running,
            zombie_status: ZombieStatus::None,
            started_at: Utc::now(),
            ended_at: None,
            last_step_at: None,
            suspected_at: None,
            pardoned_at: None,
            version: 0,
        };

        let steps = match request.workflow_id {
            Some(workflow_id) => self
                .get_workflow(workflow_id)
                .await?
                .steps
                .iter()
                .enumerate()
                .map(|(i, name)| Step::pending(run.id, i as i64 + 1, name.clone()))
                .collect(),
            None => Vec::new(),
        };

        let event = NewAgentEvent::new(run.agent_id.clone(), EventKind::RunStarted)
            .for_session(run.session_key.clone())
            .with_detail(serde_json::json!({
                "run_id": run.id,
                "task_id": run.task_id,
                "workflow_id": run.workflow_id,
                "steps": steps.len(),
            }))
            .at(run.started_at);

        match self.db.insert_run(&run, &steps, &event).await {
            Ok(()) => {}
            Err(e) if e.is_constraint() => {
                return Err(RunError::SessionActive {
                    session_key: run.session_key,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            run_id = %run.id,
            session_key = %run.session_key,
            agent_id = %run.agent_id,
            steps = steps.len(),
            "Run started"
        );
        Ok(run)
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Run, RunError> {
        self.db.get_run(id).await?.ok_or(RunError::NotFound { id })
    }

    /// Most recent run for a session key, in any status.
    pub async fn run_for_session(&self, session_key: &str) -> Result<Run, RunError> {
        self.db
            .get_latest_run_by_session(session_key)
            .await?
            .ok_or_else(|| RunError::SessionNotFound {
                session_key: session_key.to_string(),
            })
    }

    pub async fn active_runs(&self) -> Result<Vec<Run>, RunError> {
        Ok(self.db.list_runs_by_status(RunStatus::Running).await?)
    }

    pub async fn steps(&self, run_id: Uuid) -> Result<Vec<Step>, RunError> {
        Ok(self.db.list_steps(run_id).await?)
    }

    pub async fn run_progress(&self, run_id: Uuid) -> Result<RunProgress, RunError> {
        self.get_run(run_id).await?;
        Ok(RunProgress::from_steps(&self.steps(run_id).await?))
    }

    // ── Steps ───────────────────────────────────────────────────────

    /// Mark a step as running (`pending → running`).
    ///
    /// Starting a step that is already running is a no-op.
    pub async fn start_step(&self, run_id: Uuid, order: i64) -> Result<Step, RunError> {
        let run = self.running(run_id).await?;
        let steps = self.steps(run_id).await?;
        let existing = check_order(&run, &steps, order)?;

        let now = Utc::now();
        let (step, write) = match existing {
            Some(step) if step.status == StepStatus::Running => return Ok(step.clone()),
            Some(step) => {
                let step = Step {
                    status: StepStatus::Running,
                    started_at: Some(now),
                    ..step.clone()
                };
                (step.clone(), Mutation::SaveStep(step))
            }
            None => {
                let step = Step {
                    status: StepStatus::Running,
                    started_at: Some(now),
                    ..Step::pending(run_id, order, default_step_name(order))
                };
                (step.clone(), Mutation::InsertStep(step))
            }
        };

        let event = NewAgentEvent::new(run.agent_id.clone(), EventKind::StepStarted)
            .for_session(run.session_key.clone())
            .with_detail(serde_json::json!({ "run_id": run_id, "order": order, "name": step.name }))
            .at(now);
        let touched = Run {
            last_step_at: Some(now),
            ..run.clone()
        };

        self.commit_run(
            run_id,
            &[write, Mutation::SaveRun(touched), Mutation::AppendEvent(event)],
        )
        .await?;
        debug!(run_id = %run_id, order, "Step started");
        Ok(step)
    }

    /// Move a step to a terminal outcome.
    ///
    /// Advancing the final step of a workflow run also ends the run:
    /// `done`/`skipped` complete it, `failed` fails it.
    pub async fn advance_step(
        &self,
        run_id: Uuid,
        order: i64,
        outcome: StepOutcome,
    ) -> Result<Advanced, RunError> {
        let run = self.running(run_id).await?;
        let steps = self.steps(run_id).await?;
        let existing = check_order(&run, &steps, order)?;

        let now = Utc::now();
        let status = StepStatus::from(outcome);
        let (step, write) = match existing {
            Some(step) => {
                let step = Step {
                    status,
                    started_at: step.started_at.or(Some(now)),
                    completed_at: Some(now),
                    ..step.clone()
                };
                (step.clone(), Mutation::SaveStep(step))
            }
            None => {
                let step = Step {
                    status,
                    started_at: Some(now),
                    completed_at: Some(now),
                    ..Step::pending(run_id, order, default_step_name(order))
                };
                (step.clone(), Mutation::InsertStep(step))
            }
        };

        let kind = match outcome {
            StepOutcome::Done => EventKind::StepDone,
            StepOutcome::Failed => EventKind::StepFailed,
            StepOutcome::Skipped => EventKind::StepSkipped,
        };
        let mut mutations = vec![
            write,
            Mutation::AppendEvent(
                NewAgentEvent::new(run.agent_id.clone(), kind)
                    .for_session(run.session_key.clone())
                    .with_detail(serde_json::json!({ "run_id": run_id, "order": order, "name": step.name }))
                    .at(now),
            ),
        ];

        let max_order = steps.last().map(|s| s.step_order).unwrap_or(0);
        let ends_workflow = run.workflow_id.is_some() && existing.is_some() && order == max_order;
        let mut updated = Run {
            last_step_at: Some(now),
            ..run.clone()
        };
        if ends_workflow {
            updated.status = match outcome {
                StepOutcome::Failed => RunStatus::Failed,
                StepOutcome::Done | StepOutcome::Skipped => RunStatus::Completed,
            };
            updated.ended_at = Some(now);
            mutations.push(Mutation::AppendEvent(run_end_event(&updated, "final step advanced")));
        }
        mutations.push(Mutation::SaveRun(updated.clone()));

        self.commit_run(run_id, &mutations).await?;
        debug!(run_id = %run_id, order, outcome = %status, "Step advanced");
        if ends_workflow {
            info!(run_id = %run_id, status = %updated.status, "Workflow run finished");
        }
        Ok(Advanced {
            step,
            run_status: updated.status,
        })
    }

    /// End a run. `completed` requires every step to be terminal.
    pub async fn end_run(&self, run_id: Uuid, outcome: RunOutcome) -> Result<Run, RunError> {
        let run = self.running(run_id).await?;
        if outcome == RunOutcome::Completed {
            let progress = RunProgress::from_steps(&self.steps(run_id).await?);
            if !progress.all_terminal() {
                return Err(RunError::InvalidTransition {
                    run_id,
                    reason: format!(
                        "cannot complete with {} pending and {} running steps",
                        progress.pending, progress.running
                    ),
                });
            }
        }

        let ended = Run {
            status: outcome.into(),
            ended_at: Some(Utc::now()),
            ..run
        };
        self.commit_run(
            run_id,
            &[
                Mutation::SaveRun(ended.clone()),
                Mutation::AppendEvent(run_end_event(&ended, "ended by agent")),
            ],
        )
        .await?;
        info!(run_id = %run_id, session_key = %ended.session_key, status = %ended.status, "Run ended");
        Ok(Run {
            version: ended.version + 1,
            ..ended
        })
    }

    async fn running(&self, run_id: Uuid) -> Result<Run, RunError> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(RunError::RunTerminal {
                run_id,
                status: run.status.to_string(),
            });
        }
        Ok(run)
    }

    async fn commit_run(&self, run_id: Uuid, mutations: &[Mutation]) -> Result<(), RunError> {
        match self.db.commit(mutations).await {
            Ok(CommitOutcome::Committed) => Ok(()),
            Ok(CommitOutcome::Stale { .. }) => Err(RunError::Stale { id: run_id }),
            // A concurrent writer created the same step first.
            Err(e) if e.is_constraint() => Err(RunError::Stale { id: run_id }),
            Err(e) => Err(e.into()),
        }
    }
}

fn default_step_name(order: i64) -> String {
    format!("step-{order}")
}

/// Validate ordering for a step about to change, returning it if it exists.
fn check_order<'a>(run: &Run, steps: &'a [Step], order: i64) -> Result<Option<&'a Step>, RunError> {
    let out_of_order = |reason: String| RunError::OutOfOrder {
        run_id: run.id,
        order,
        reason,
    };

    if order < 1 {
        return Err(out_of_order("step orders start at 1".into()));
    }

    let existing = steps.iter().find(|s| s.step_order == order);
    match existing {
        Some(step) if step.status.is_terminal() => {
            return Err(out_of_order(format!("step is already {}", step.status)));
        }
        Some(_) => {}
        None => {
            let next = steps.last().map(|s| s.step_order).unwrap_or(0) + 1;
            if order != next {
                return Err(out_of_order(format!("step does not exist; next step is {next}")));
            }
        }
    }

    if let Some(blocking) = steps
        .iter()
        .find(|s| s.step_order < order && !s.status.is_terminal())
    {
        return Err(out_of_order(format!(
            "step {} is still {}",
            blocking.step_order, blocking.status
        )));
    }
    Ok(existing)
}

fn run_end_event(run: &Run, reason: &str) -> NewAgentEvent {
    let kind = match run.status {
        RunStatus::Failed => EventKind::RunFailed,
        _ => EventKind::RunCompleted,
    };
    let mut event = NewAgentEvent::new(run.agent_id.clone(), kind)
        .for_session(run.session_key.clone())
        .with_detail(serde_json::json!({ "run_id": run.id, "reason": reason }));
    event.created_at = run.ended_at;
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::Task;
    use crate::error::ErrorKind;
    use crate::store::LibSqlBackend;

    async fn test_tracker() -> (RunTracker, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (RunTracker::new(Arc::clone(&db)), db)
    }

    async fn workflow_run(tracker: &RunTracker, session: &str, steps: &[&str]) -> Run {
        let wf = tracker
            .register_workflow(
                &format!("wf-{session}"),
                None,
                steps.iter().map(|s| s.to_string()).collect(),
            )
            .await
            .unwrap();
        tracker
            .start_run(StartRun::new(session, "coder").with_workflow(wf.id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn start_run_rejects_active_session() {
        let (tracker, _) = test_tracker().await;
        tracker.start_run(StartRun::new("sess", "a")).await.unwrap();
        let err = tracker.start_run(StartRun::new("sess", "b")).await.unwrap_err();
        assert!(matches!(err, RunError::SessionActive { .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn session_key_reusable_after_run_ends() {
        let (tracker, _) = test_tracker().await;
        let first = tracker.start_run(StartRun::new("sess", "a")).await.unwrap();
        tracker.end_run(first.id, RunOutcome::Failed).await.unwrap();

        let second = tracker.start_run(StartRun::new("sess", "a")).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(tracker.run_for_session("sess").await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn start_run_checks_task_and_workflow() {
        let (tracker, db) = test_tracker().await;
        let err = tracker
            .start_run(StartRun::new("s", "a").for_task(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::TaskNotFound { .. }));

        let err = tracker
            .start_run(StartRun::new("s", "a").with_workflow(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::WorkflowNotFound { .. }));

        let task = Task::new("t");
        db.insert_task(&task).await.unwrap();
        let run = tracker
            .start_run(StartRun::new("s", "a").for_task(task.id))
            .await
            .unwrap();
        assert_eq!(run.task_id, Some(task.id));
    }

    #[tokio::test]
    async fn workflow_run_precreates_pending_steps() {
        let (tracker, _) = test_tracker().await;
        let run = workflow_run(&tracker, "s", &["plan", "code", "test"]).await;
        let steps = tracker.steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(steps[1].name, "code");
        assert_eq!(steps[2].step_order, 3);
    }

    #[tokio::test]
    async fn advancing_before_lower_steps_exist_is_out_of_order() {
        let (tracker, _) = test_tracker().await;
        let run = tracker.start_run(StartRun::new("s", "a")).await.unwrap();
        tracker.advance_step(run.id, 1, StepOutcome::Done).await.unwrap();

        let err = tracker
            .advance_step(run.id, 3, StepOutcome::Done)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::OutOfOrder { order: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::OutOfOrder);
        assert!(!err.kind().is_retryable());

        tracker.advance_step(run.id, 2, StepOutcome::Skipped).await.unwrap();
        tracker.advance_step(run.id, 3, StepOutcome::Done).await.unwrap();
        assert_eq!(tracker.steps(run.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn lower_pending_step_blocks_advance() {
        let (tracker, _) = test_tracker().await;
        let run = workflow_run(&tracker, "s", &["a", "b", "c"]).await;

        let err = tracker
            .advance_step(run.id, 2, StepOutcome::Done)
            .await
            .unwrap_err();
        match err {
            RunError::OutOfOrder { reason, .. } => assert!(reason.contains("step 1")),
            other => panic!("expected out of order, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn readvancing_terminal_step_is_out_of_order() {
        let (tracker, _) = test_tracker().await;
        let run = tracker.start_run(StartRun::new("s", "a")).await.unwrap();
        tracker.advance_step(run.id, 1, StepOutcome::Done).await.unwrap();
        let err = tracker
            .advance_step(run.id, 1, StepOutcome::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::OutOfOrder { .. }));
    }

    #[tokio::test]
    async fn final_workflow_step_ends_run() {
        let (tracker, _) = test_tracker().await;
        let run = workflow_run(&tracker, "s", &["a", "b"]).await;

        let first = tracker.advance_step(run.id, 1, StepOutcome::Done).await.unwrap();
        assert_eq!(first.run_status, RunStatus::Running);
        let last = tracker.advance_step(run.id, 2, StepOutcome::Skipped).await.unwrap();
        assert_eq!(last.run_status, RunStatus::Completed);

        let ended = tracker.get_run(run.id).await.unwrap();
        assert_eq!(ended.status, RunStatus::Completed);
        assert!(ended.ended_at.is_some());

        let err = tracker.advance_step(run.id, 3, StepOutcome::Done).await.unwrap_err();
        assert!(matches!(err, RunError::RunTerminal { .. }));
    }

    #[tokio::test]
    async fn failed_final_step_fails_run() {
        let (tracker, _) = test_tracker().await;
        let run = workflow_run(&tracker, "s", &["only"]).await;
        let advanced = tracker.advance_step(run.id, 1, StepOutcome::Failed).await.unwrap();
        assert_eq!(advanced.run_status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn complete_requires_terminal_steps() {
        let (tracker, _) = test_tracker().await;
        let run = workflow_run(&tracker, "s", &["a", "b"]).await;
        tracker.start_step(run.id, 1).await.unwrap();

        let err = tracker.end_run(run.id, RunOutcome::Completed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        let failed = tracker.end_run(run.id, RunOutcome::Failed).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        let again = tracker.end_run(run.id, RunOutcome::Failed).await.unwrap_err();
        assert!(matches!(again, RunError::RunTerminal { .. }));
    }

    #[tokio::test]
    async fn step_advance_stamps_progress_and_logs_event() {
        let (tracker, db) = test_tracker().await;
        let run = tracker.start_run(StartRun::new("s", "a")).await.unwrap();
        assert!(run.last_step_at.is_none());

        tracker.start_step(run.id, 1).await.unwrap();
        tracker.advance_step(run.id, 1, StepOutcome::Done).await.unwrap();

        let reloaded = tracker.get_run(run.id).await.unwrap();
        assert!(reloaded.last_step_at.is_some());
        assert_eq!(reloaded.version, 2);

        let done = db
            .recent_events("s", Some(&EventKind::StepDone), 10)
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].detail["order"], 1);

        let progress = tracker.run_progress(run.id).await.unwrap();
        assert_eq!(progress.total, 1);
        assert_eq!(progress.done, 1);
    }

    #[tokio::test]
    async fn referenced_workflow_cannot_change() {
        let (tracker, _) = test_tracker().await;
        let wf = tracker
            .register_workflow("release", None, vec!["build".into()])
            .await
            .unwrap();

        let replaced = tracker
            .register_workflow("release", None, vec!["build".into(), "ship".into()])
            .await
            .unwrap();
        assert_eq!(replaced.id, wf.id);
        assert_eq!(replaced.version, 1);

        tracker
            .start_run(StartRun::new("s", "a").with_workflow(wf.id))
            .await
            .unwrap();
        let err = tracker
            .register_workflow("release", None, vec!["ship".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::WorkflowReferenced { .. }));

        let same = tracker
            .register_workflow("release", None, vec!["build".into(), "ship".into()])
            .await
            .unwrap();
        assert_eq!(same.steps.len(), 2);
    }

    #[tokio::test]
    async fn workflow_description_is_stored_and_editable_while_referenced() {
        let (tracker, db) = test_tracker().await;
        let wf = tracker
            .register_workflow("deploy", Some("Build then ship"), vec!["build".into(), "ship".into()])
            .await
            .unwrap();
        assert_eq!(wf.description.as_deref(), Some("Build then ship"));
        tracker
            .start_run(StartRun::new("s", "a").with_workflow(wf.id))
            .await
            .unwrap();

        let renamed = tracker
            .register_workflow("deploy", Some("Build, then ship to prod"), vec!["build".into(), "ship".into()])
            .await
            .unwrap();
        assert_eq!(renamed.id, wf.id);
        assert_eq!(renamed.version, 1);

        let stored = db.get_workflow_by_name("deploy").await.unwrap().unwrap();
        assert_eq!(stored.description.as_deref(), Some("Build, then ship to prod"));
        assert_eq!(stored.steps, vec!["build".to_string(), "ship".to_string()]);
        assert_eq!(stored.version, 1);
    }
}
