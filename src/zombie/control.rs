//! Operator controls: kill, pardon and the zombie listing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assignments::{AssignmentOutcome, completion_mutations};
use crate::error::{DatabaseError, RunError};
use crate::events::{EventKind, EventLog, NewAgentEvent};
use crate::runs::{Run, RunStatus, ZombieStatus};
use crate::store::{CommitOutcome, Database, Mutation};

/// Optimistic retries for kill and pardon.
const CONTROL_RETRIES: usize = 3;

/// Physically stops an agent session (process, container, tmux pane...).
#[async_trait]
pub trait SessionTerminator: Send + Sync {
    async fn terminate(
        &self,
        session_key: &str,
        agent_id: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Structured result of a control action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub message: String,
    /// Set when the action committed but a follow-up was not confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
}

impl ControlOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            caveat: None,
        }
    }

    fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            caveat: None,
        }
    }
}

/// A suspected run as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ZombieSummary {
    pub run_id: Uuid,
    pub session_key: String,
    pub agent_id: String,
    pub task_id: Option<Uuid>,
    pub zombie_status: ZombieStatus,
    pub started_at: DateTime<Utc>,
    pub suspected_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ZombieControl {
    db: Arc<dyn Database>,
    events: EventLog,
    terminator: Option<Arc<dyn SessionTerminator>>,
}

impl ZombieControl {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            events: EventLog::new(Arc::clone(&db)),
            db,
            terminator: None,
        }
    }

    /// Builder: hook used to stop the session after a kill commits.
    pub fn with_terminator(mut self, terminator: Arc<dyn SessionTerminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Kill the session's run.
    ///
    /// Fails the run, marks it killed and cancels its live assignment
    /// (claims released, task re-queued) in one transaction, then asks the
    /// terminator to stop the process. Killing an already finished run is a
    /// successful no-op.
    pub async fn kill(&self, session_key: &str, reason: &str) -> Result<ControlOutcome, RunError> {
        for _ in 0..CONTROL_RETRIES {
            let run = self.latest_run(session_key).await?;
            if run.status.is_terminal() {
                return Ok(ControlOutcome::ok(format!(
                    "Session {session_key} already ended ({}, zombie_status {})",
                    run.status, run.zombie_status
                )));
            }

            let now = Utc::now();
            let killed = Run {
                status: RunStatus::Failed,
                ended_at: Some(now),
                ..run.zombie_moved_to(ZombieStatus::Killed)?
            };
            let mut mutations = vec![
                Mutation::SaveRun(killed),
                Mutation::AppendEvent(
                    NewAgentEvent::new(run.agent_id.clone(), EventKind::TaskKill)
                        .with_detail(serde_json::json!({
                            "run_id": run.id,
                            "task_id": run.task_id,
                            "reason": reason,
                        }))
                        .at(now),
                ),
            ];

            let assignment = self.db.get_live_assignment_for_run(run.id).await?;
            if let Some(assignment) = &assignment {
                let task = self.db.get_task(assignment.task_id).await?;
                let (_, cancel) =
                    completion_mutations(assignment, task.as_ref(), AssignmentOutcome::Cancelled, now);
                mutations.extend(cancel);
            }
            for mutation in &mut mutations {
                if let Mutation::AppendEvent(event) = mutation {
                    event.session_key.get_or_insert_with(|| run.session_key.clone());
                }
            }

            match self.db.commit(&mutations).await? {
                CommitOutcome::Committed => {
                    warn!(
                        session_key,
                        run_id = %run.id,
                        agent_id = %run.agent_id,
                        assignment_id = ?assignment.as_ref().map(|a| a.id),
                        reason,
                        "Session killed"
                    );
                    let mut outcome = ControlOutcome::ok(format!("Killed session {session_key}: {reason}"));
                    outcome.caveat = self.terminate(&run).await;
                    return Ok(outcome);
                }
                CommitOutcome::Stale { .. } => continue,
            }
        }
        Err(RunError::Stale {
            id: self.latest_run(session_key).await?.id,
        })
    }

    /// Clear the zombie flag and restart the heuristic clocks.
    ///
    /// Never changes the run's lifecycle status. Finished runs cannot be
    /// pardoned.
    pub async fn pardon(&self, session_key: &str) -> Result<ControlOutcome, RunError> {
        for _ in 0..CONTROL_RETRIES {
            let run = self.latest_run(session_key).await?;
            if run.status.is_terminal() {
                return Ok(ControlOutcome::refused(format!(
                    "Session {session_key} already ended ({}); nothing to pardon",
                    run.status
                )));
            }

            let now = Utc::now();
            let pardoned = Run {
                suspected_at: None,
                pardoned_at: Some(now),
                ..run.zombie_moved_to(ZombieStatus::None)?
            };
            let event = NewAgentEvent::new(run.agent_id.clone(), EventKind::ZombiePardon)
                .for_session(run.session_key.clone())
                .with_detail(serde_json::json!({
                    "run_id": run.id,
                    "previous": run.zombie_status,
                }))
                .at(now);

            match self
                .db
                .commit(&[Mutation::SaveRun(pardoned), Mutation::AppendEvent(event)])
                .await?
            {
                CommitOutcome::Committed => {
                    info!(session_key, run_id = %run.id, previous = %run.zombie_status, "Session pardoned");
                    return Ok(ControlOutcome::ok(format!("Pardoned session {session_key}")));
                }
                CommitOutcome::Stale { .. } => continue,
            }
        }
        Err(RunError::Stale {
            id: self.latest_run(session_key).await?.id,
        })
    }

    /// Running runs currently flagged as suspected.
    pub async fn list_zombies(&self) -> Result<Vec<ZombieSummary>, DatabaseError> {
        let runs = self.db.list_runs_by_status(RunStatus::Running).await?;
        let mut zombies = Vec::new();
        for run in runs
            .into_iter()
            .filter(|r| r.zombie_status.normalized() == ZombieStatus::Suspected)
        {
            zombies.push(ZombieSummary {
                last_activity: self.events.last_activity(&run.session_key).await?,
                last_heartbeat: self.events.last_heartbeat(&run.session_key).await?,
                run_id: run.id,
                session_key: run.session_key,
                agent_id: run.agent_id,
                task_id: run.task_id,
                zombie_status: run.zombie_status,
                started_at: run.started_at,
                suspected_at: run.suspected_at,
            });
        }
        Ok(zombies)
    }

    async fn latest_run(&self, session_key: &str) -> Result<Run, RunError> {
        self.db
            .get_latest_run_by_session(session_key)
            .await?
            .ok_or_else(|| RunError::SessionNotFound {
                session_key: session_key.to_string(),
            })
    }

    /// Best-effort physical termination. Returns a caveat when unconfirmed.
    async fn terminate(&self, run: &Run) -> Option<String> {
        let Some(terminator) = &self.terminator else {
            return Some("no session terminator configured; the agent process may still be running".into());
        };
        match terminator.terminate(&run.session_key, &run.agent_id).await {
            Ok(()) => None,
            Err(e) => {
                warn!(session_key = %run.session_key, error = %e, "Session terminator failed");
                Some(format!("termination hook failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::assignments::{AssignRequest, AssignmentStatus, Allocator};
    use crate::backlog::{Task, TaskStatus};
    use crate::runs::{RunTracker, StartRun};
    use crate::store::LibSqlBackend;

    #[derive(Default)]
    struct RecordingTerminator {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl SessionTerminator for RecordingTerminator {
        async fn terminate(
            &self,
            session_key: &str,
            _agent_id: &str,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.calls.lock().unwrap().push(session_key.to_string());
            if self.fail {
                return Err("pane not found".into());
            }
            Ok(())
        }
    }

    async fn test_db() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn kill_cancels_assignment_and_is_idempotent() {
        let db = test_db().await;
        let allocator = Allocator::new(Arc::clone(&db), "/wt");
        let task = Task::new("t").with_status(TaskStatus::Queued);
        db.insert_task(&task).await.unwrap();
        let a = allocator.assign(AssignRequest::new(task.id, "coder", "r", "b")).await.unwrap();
        allocator.declare_files(a.id, &["x.py".to_string()]).await.unwrap();
        let (_, run) = allocator.begin_work(a.id, "sess", None).await.unwrap();

        let terminator = Arc::new(RecordingTerminator::default());
        let control = ZombieControl::new(Arc::clone(&db)).with_terminator(terminator.clone());

        let outcome = control.kill("sess", "operator request").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.caveat.is_none());

        let run = db.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.zombie_status, ZombieStatus::Killed);
        assert_eq!(allocator.get(a.id).await.unwrap().status, AssignmentStatus::Cancelled);
        assert_eq!(db.get_task(task.id).await.unwrap().unwrap().status, TaskStatus::Queued);
        assert!(db.list_active_claims().await.unwrap().is_empty());

        let again = control.kill("sess", "operator request").await.unwrap();
        assert!(again.success);
        assert_eq!(terminator.calls.lock().unwrap().len(), 1);

        let kills = db.recent_events("sess", Some(&EventKind::TaskKill), 10).await.unwrap();
        assert_eq!(kills.len(), 1);
    }

    #[tokio::test]
    async fn kill_without_hook_is_soft_success() {
        let db = test_db().await;
        RunTracker::new(Arc::clone(&db))
            .start_run(StartRun::new("sess", "coder"))
            .await
            .unwrap();

        let outcome = ZombieControl::new(Arc::clone(&db)).kill("sess", "stuck").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.caveat.unwrap().contains("no session terminator"));

        let failing = Arc::new(RecordingTerminator {
            fail: true,
            ..Default::default()
        });
        RunTracker::new(Arc::clone(&db))
            .start_run(StartRun::new("sess-2", "coder"))
            .await
            .unwrap();
        let outcome = ZombieControl::new(Arc::clone(&db))
            .with_terminator(failing)
            .kill("sess-2", "stuck")
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.caveat.unwrap().contains("pane not found"));
    }

    #[tokio::test]
    async fn kill_unknown_session_is_not_found() {
        let control = ZombieControl::new(test_db().await);
        let err = control.kill("nope", "x").await.unwrap_err();
        assert!(matches!(err, RunError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn pardon_resets_zombie_status_only() {
        let db = test_db().await;
        let run = RunTracker::new(Arc::clone(&db))
            .start_run(StartRun::new("sess", "coder"))
            .await
            .unwrap();
        let suspected = Run {
            zombie_status: ZombieStatus::Suspected,
            suspected_at: Some(Utc::now()),
            ..run.clone()
        };
        db.commit(&[Mutation::SaveRun(suspected)]).await.unwrap();

        let control = ZombieControl::new(Arc::clone(&db));
        assert_eq!(control.list_zombies().await.unwrap().len(), 1);

        let outcome = control.pardon("sess").await.unwrap();
        assert!(outcome.success);

        let pardoned = db.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(pardoned.status, RunStatus::Running);
        assert_eq!(pardoned.zombie_status, ZombieStatus::None);
        assert!(pardoned.pardoned_at.is_some());
        assert!(pardoned.suspected_at.is_none());
        assert!(control.list_zombies().await.unwrap().is_empty());

        control.kill("sess", "done waiting").await.unwrap();
        let refused = control.pardon("sess").await.unwrap();
        assert!(!refused.success);
        let killed = db.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(killed.zombie_status, ZombieStatus::Killed);
    }

    #[tokio::test]
    async fn pardon_cannot_revive_a_killed_classification() {
        let db = test_db().await;
        let run = RunTracker::new(Arc::clone(&db))
            .start_run(StartRun::new("sess", "coder"))
            .await
            .unwrap();
        let marked = Run {
            zombie_status: ZombieStatus::Killed,
            ..run.clone()
        };
        db.commit(&[Mutation::SaveRun(marked)]).await.unwrap();

        let err = ZombieControl::new(Arc::clone(&db)).pardon("sess").await.unwrap_err();
        assert!(matches!(err, RunError::InvalidTransition { .. }));
        let stored = db.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.zombie_status, ZombieStatus::Killed);
        assert!(stored.pardoned_at.is_none());
    }
}
