//! Task assignment allocator.
//!
//! Binds a task to an agent, a repo branch and a worktree, tracks the
//! assignment through review and merge, and owns the file claims the agent
//! declares along the way. Every multi-row change commits as one unit of work.

pub mod model;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backlog::{Task, TaskStatus};
use crate::claims::{ClaimAttempt, FileClaim, FileClaimManager, normalize_path};
use crate::error::AssignmentError;
use crate::events::{EventKind, NewAgentEvent};
use crate::runs::{Run, RunOutcome, RunTracker, StartRun};
use crate::store::{CommitOutcome, Database, Mutation};

pub use model::{AssignRequest, AssignmentOutcome, AssignmentStatus, TaskAssignment};

/// Optimistic retries when saving a file manifest.
const MANIFEST_RETRIES: usize = 3;

#[derive(Clone)]
pub struct Allocator {
    db: Arc<dyn Database>,
    claims: FileClaimManager,
    runs: RunTracker,
    worktree_root: PathBuf,
}

impl Allocator {
    pub fn new(db: Arc<dyn Database>, worktree_root: impl Into<PathBuf>) -> Self {
        Self {
            claims: FileClaimManager::new(Arc::clone(&db)),
            runs: RunTracker::new(Arc::clone(&db)),
            db,
            worktree_root: worktree_root.into(),
        }
    }

    pub fn claims(&self) -> &FileClaimManager {
        &self.claims
    }

    pub fn runs(&self) -> &RunTracker {
        &self.runs
    }

    /// Bind a task to an agent. The task moves to `assigned`.
    pub async fn assign(&self, request: AssignRequest) -> Result<TaskAssignment, AssignmentError> {
        let task = self
            .db
            .get_task(request.task_id)
            .await?
            .ok_or(AssignmentError::TaskNotFound { id: request.task_id })?;

        if let Some(live) = self.db.get_live_assignment_for_task(task.id).await? {
            return Err(AssignmentError::TaskAlreadyAssigned {
                task_id: task.id,
                assignment_id: live.id,
            });
        }
        if !task.status.is_assignable() {
            return Err(AssignmentError::InvalidTransition {
                id: task.id,
                from: task.status.to_string(),
                to: TaskStatus::Assigned.to_string(),
            });
        }

        let now = Utc::now();
        let worktree_path = request
            .worktree_path
            .unwrap_or_else(|| self.worktree_root.join(&request.repo).join(&request.branch));
        let assignment = TaskAssignment {
            id: Uuid::new_v4(),
            task_id: task.id,
            agent_id: request.agent_id,
            repo: request.repo,
            branch: request.branch,
            worktree_path,
            description: request.description.unwrap_or_else(|| task.title.clone()),
            file_manifest: Vec::new(),
            status: AssignmentStatus::Assigned,
            parent_task_id: request.parent_task_id,
            run_id: None,
            version: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        let event = NewAgentEvent::new(assignment.agent_id.clone(), EventKind::TaskAssigned)
            .with_detail(serde_json::json!({
                "assignment_id": assignment.id,
                "task_id": task.id,
                "repo": assignment.repo,
                "branch": assignment.branch,
                "worktree_path": assignment.worktree_path,
            }))
            .at(now);
        let mutations = [
            Mutation::InsertAssignment(assignment.clone()),
            Mutation::SaveTask(task.moved_to(TaskStatus::Assigned)),
            Mutation::AppendEvent(event),
        ];

        match self.db.commit(&mutations).await {
            Ok(CommitOutcome::Committed) => {}
            Ok(CommitOutcome::Stale { .. }) => return Err(AssignmentError::Stale { id: task.id }),
            Err(e) if e.is_constraint() => {
                // Lost the race against a concurrent assign.
                let assignment_id = self
                    .db
                    .get_live_assignment_for_task(task.id)
                    .await?
                    .map(|a| a.id)
                    .unwrap_or_default();
                return Err(AssignmentError::TaskAlreadyAssigned {
                    task_id: task.id,
                    assignment_id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            assignment_id = %assignment.id,
            task_id = %task.id,
            agent_id = %assignment.agent_id,
            worktree = %assignment.worktree_path.display(),
            "Task assigned"
        );
        Ok(assignment)
    }

    /// Claim every listed path for the assignment, all or nothing.
    ///
    /// On conflict, claims acquired by this call are released again and the
    /// conflicting paths are returned.
    pub async fn declare_files(
        &self,
        id: Uuid,
        file_paths: &[String],
    ) -> Result<TaskAssignment, AssignmentError> {
        let assignment = self.live(id).await?;

        let mut seen = HashSet::new();
        let paths: Vec<String> = file_paths
            .iter()
            .map(|p| normalize_path(p))
            .filter(|p| !p.is_empty() && seen.insert(p.clone()))
            .collect();

        let mut acquired = Vec::new();
        let mut conflicts = Vec::new();
        for path in &paths {
            let claim = FileClaim::new(assignment.agent_id.clone(), path.clone()).for_assignment(id);
            match self.claims.try_acquire(claim).await {
                Ok(ClaimAttempt::Acquired(claim)) => acquired.push(claim),
                Ok(ClaimAttempt::AlreadyHeld(_)) => {}
                Ok(ClaimAttempt::Conflict(holder)) => conflicts.push(holder.file_path),
                Err(e) => {
                    self.release_acquired(&acquired).await;
                    return Err(e.into());
                }
            }
        }

        if !conflicts.is_empty() {
            self.release_acquired(&acquired).await;
            warn!(
                assignment_id = %id,
                agent_id = %assignment.agent_id,
                conflicts = ?conflicts,
                "File declaration rejected"
            );
            return Err(AssignmentError::FileConflict { paths: conflicts });
        }

        let mut current = assignment;
        for _ in 0..MANIFEST_RETRIES {
            let mut manifest = current.file_manifest.clone();
            for path in &paths {
                if !manifest.contains(path) {
                    manifest.push(path.clone());
                }
            }
            let updated = TaskAssignment {
                file_manifest: manifest,
                ..current.clone()
            };
            let event = NewAgentEvent::new(updated.agent_id.clone(), EventKind::FilesDeclared)
                .with_detail(serde_json::json!({ "assignment_id": id, "files": paths }));
            let event = self.with_session(&updated, event).await?;

            match self
                .db
                .commit(&[Mutation::SaveAssignment(updated.clone()), Mutation::AppendEvent(event)])
                .await?
            {
                CommitOutcome::Committed => {
                    info!(assignment_id = %id, files = paths.len(), "Files declared");
                    return Ok(TaskAssignment {
                        version: updated.version + 1,
                        ..updated
                    });
                }
                CommitOutcome::Stale { .. } => match self.live(id).await {
                    Ok(fresh) => current = fresh,
                    Err(e) => {
                        self.release_acquired(&acquired).await;
                        return Err(e);
                    }
                },
            }
        }

        self.release_acquired(&acquired).await;
        Err(AssignmentError::Stale { id })
    }

    /// Move an assignment along its lifecycle.
    ///
    /// Terminal targets go through [`Allocator::complete`].
    pub async fn transition(
        &self,
        id: Uuid,
        next: AssignmentStatus,
    ) -> Result<TaskAssignment, AssignmentError> {
        if let Some(outcome) = terminal_outcome(next) {
            return self.complete(id, outcome).await;
        }

        let assignment = self.get(id).await?;
        if !assignment.status.can_transition_to(next) {
            return Err(invalid(&assignment, next));
        }
        let task = self.task_of(&assignment).await?;

        let now = Utc::now();
        let updated = TaskAssignment {
            status: next,
            started_at: match next {
                AssignmentStatus::InProgress => assignment.started_at.or(Some(now)),
                _ => assignment.started_at,
            },
            ..assignment.clone()
        };

        let mut mutations = vec![Mutation::SaveAssignment(updated.clone())];
        let task_status = match next {
            AssignmentStatus::InProgress => Some(TaskStatus::Running),
            AssignmentStatus::Review => Some(TaskStatus::Review),
            _ => None,
        };
        if let Some(status) = task_status.filter(|s| *s != task.status) {
            mutations.push(Mutation::SaveTask(task.moved_to(status)));
        }
        let event = self
            .with_session(&assignment, transition_event(&assignment, next, now))
            .await?;
        mutations.push(Mutation::AppendEvent(event));

        self.commit_assignment(id, &mutations).await?;
        info!(assignment_id = %id, from = %assignment.status, to = %next, "Assignment transitioned");
        Ok(TaskAssignment {
            version: updated.version + 1,
            ..updated
        })
    }

    /// Finish an assignment and release all of its claims.
    ///
    /// The task moves to `done`, `failed` or back to `queued`. Completing with
    /// the status the assignment already has is a no-op.
    pub async fn complete(
        &self,
        id: Uuid,
        outcome: AssignmentOutcome,
    ) -> Result<TaskAssignment, AssignmentError> {
        let assignment = self.get(id).await?;
        let target = AssignmentStatus::from(outcome);
        if assignment.status == target {
            return Ok(assignment);
        }
        if !assignment.status.can_transition_to(target) {
            return Err(invalid(&assignment, target));
        }
        let task = self.task_of(&assignment).await?;

        let now = Utc::now();
        let (updated, mut mutations) = completion_mutations(&assignment, Some(&task), outcome, now);
        if let Some(Mutation::AppendEvent(event)) = mutations.last_mut() {
            *event = self.with_session(&assignment, event.clone()).await?;
        }

        self.commit_assignment(id, &mutations).await?;
        info!(
            assignment_id = %id,
            task_id = %task.id,
            outcome = %target,
            "Assignment completed"
        );
        Ok(TaskAssignment {
            version: updated.version + 1,
            ..updated
        })
    }

    /// Start a run for an `assigned` assignment and bind it.
    ///
    /// The assignment moves to `in_progress` and its task to `running`. If the
    /// binding cannot be committed, the new run is ended as failed.
    pub async fn begin_work(
        &self,
        id: Uuid,
        session_key: &str,
        workflow_id: Option<Uuid>,
    ) -> Result<(TaskAssignment, Run), AssignmentError> {
        let assignment = self.get(id).await?;
        if assignment.status != AssignmentStatus::Assigned {
            return Err(invalid(&assignment, AssignmentStatus::InProgress));
        }
        let task = self.task_of(&assignment).await?;

        let mut request =
            StartRun::new(session_key, assignment.agent_id.clone()).for_task(assignment.task_id);
        if let Some(workflow_id) = workflow_id {
            request = request.with_workflow(workflow_id);
        }
        let run = self.runs.start_run(request).await?;

        let now = Utc::now();
        let updated = TaskAssignment {
            status: AssignmentStatus::InProgress,
            run_id: Some(run.id),
            started_at: Some(now),
            ..assignment.clone()
        };
        let event = transition_event(&assignment, AssignmentStatus::InProgress, now)
            .for_session(run.session_key.clone());
        let mutations = [
            Mutation::SaveAssignment(updated.clone()),
            Mutation::SaveTask(task.moved_to(TaskStatus::Running)),
            Mutation::AppendEvent(event),
        ];

        if let Err(e) = self.commit_assignment(id, &mutations).await {
            if let Err(end_err) = self.runs.end_run(run.id, RunOutcome::Failed).await {
                warn!(run_id = %run.id, error = %end_err, "Failed to close orphaned run");
            }
            return Err(e);
        }

        info!(
            assignment_id = %id,
            run_id = %run.id,
            session_key = %run.session_key,
            "Work started"
        );
        Ok((
            TaskAssignment {
                version: updated.version + 1,
                ..updated
            },
            run,
        ))
    }

    pub async fn get(&self, id: Uuid) -> Result<TaskAssignment, AssignmentError> {
        self.db
            .get_assignment(id)
            .await?
            .ok_or(AssignmentError::NotFound { id })
    }

    pub async fn list_live(&self) -> Result<Vec<TaskAssignment>, AssignmentError> {
        Ok(self.db.list_live_assignments().await?)
    }

    async fn live(&self, id: Uuid) -> Result<TaskAssignment, AssignmentError> {
        let assignment = self.get(id).await?;
        if !assignment.is_live() {
            return Err(AssignmentError::InvalidTransition {
                id,
                from: assignment.status.to_string(),
                to: "declare_files".into(),
            });
        }
        Ok(assignment)
    }

    async fn task_of(&self, assignment: &TaskAssignment) -> Result<Task, AssignmentError> {
        self.db
            .get_task(assignment.task_id)
            .await?
            .ok_or(AssignmentError::TaskNotFound {
                id: assignment.task_id,
            })
    }

    /// Attach the bound run's session key, if any.
    async fn with_session(
        &self,
        assignment: &TaskAssignment,
        event: NewAgentEvent,
    ) -> Result<NewAgentEvent, AssignmentError> {
        let Some(run_id) = assignment.run_id else {
            return Ok(event);
        };
        Ok(match self.db.get_run(run_id).await? {
            Some(run) => event.for_session(run.session_key),
            None => event,
        })
    }

    async fn release_acquired(&self, acquired: &[FileClaim]) {
        let now = Utc::now();
        for claim in acquired {
            if let Err(e) = self.db.release_claim_by_id(claim.id, now).await {
                warn!(file_path = %claim.file_path, error = %e, "Failed to roll back file claim");
            }
        }
    }

    async fn commit_assignment(&self, id: Uuid, mutations: &[Mutation]) -> Result<(), AssignmentError> {
        match self.db.commit(mutations).await? {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Stale { .. } => Err(AssignmentError::Stale { id }),
        }
    }
}

/// Mutations that finish an assignment: status, claim release, task status
/// and an event. Returns the assignment as it will be saved.
pub(crate) fn completion_mutations(
    assignment: &TaskAssignment,
    task: Option<&Task>,
    outcome: AssignmentOutcome,
    now: DateTime<Utc>,
) -> (TaskAssignment, Vec<Mutation>) {
    let target = AssignmentStatus::from(outcome);
    let updated = TaskAssignment {
        status: target,
        completed_at: Some(now),
        ..assignment.clone()
    };

    let mut mutations = vec![
        Mutation::SaveAssignment(updated.clone()),
        Mutation::ReleaseAssignmentClaims {
            assignment_id: assignment.id,
            released_at: now,
        },
    ];
    let task_status = match outcome {
        AssignmentOutcome::Merged => TaskStatus::Done,
        AssignmentOutcome::Failed => TaskStatus::Failed,
        AssignmentOutcome::Cancelled => TaskStatus::Queued,
    };
    if let Some(task) = task.filter(|t| t.status != task_status) {
        mutations.push(Mutation::SaveTask(task.moved_to(task_status)));
    }
    mutations.push(Mutation::AppendEvent(transition_event(assignment, target, now)));
    (updated, mutations)
}

fn transition_event(
    assignment: &TaskAssignment,
    next: AssignmentStatus,
    now: DateTime<Utc>,
) -> NewAgentEvent {
    NewAgentEvent::new(assignment.agent_id.clone(), EventKind::AssignmentTransition)
        .with_detail(serde_json::json!({
            "assignment_id": assignment.id,
            "task_id": assignment.task_id,
            "from": assignment.status,
            "to": next,
        }))
        .at(now)
}

fn terminal_outcome(status: AssignmentStatus) -> Option<AssignmentOutcome> {
    match status {
        AssignmentStatus::Merged => Some(AssignmentOutcome::Merged),
        AssignmentStatus::Failed => Some(AssignmentOutcome::Failed),
        AssignmentStatus::Cancelled => Some(AssignmentOutcome::Cancelled),
        _ => None,
    }
}

fn invalid(assignment: &TaskAssignment, next: AssignmentStatus) -> AssignmentError {
    AssignmentError::InvalidTransition {
        id: assignment.id,
        from: assignment.status.to_string(),
        to: next.to_string(),
    }
}
