//! State written through one backend survives a reopen of the database file.

use std::sync::Arc;

use foreman::assignments::{AssignRequest, Allocator, AssignmentStatus};
use foreman::backlog::{Backlog, Task, TaskStatus};
use foreman::runs::{RunStatus, StepOutcome};
use foreman::store::{Database, LibSqlBackend};

#[tokio::test]
async fn coordination_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("foreman.db");

    let (task_id, assignment_id, run_id) = {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let backlog = Backlog::new(Arc::clone(&db));
        let allocator = Allocator::new(Arc::clone(&db), dir.path().join("worktrees"));

        let task = backlog
            .ingest(Task::new("Persist me").with_status(TaskStatus::Queued))
            .await
            .unwrap();
        let assignment = allocator
            .assign(AssignRequest::new(task.id, "coder", "core", "persist"))
            .await
            .unwrap();
        let (assignment, run) = allocator
            .begin_work(assignment.id, "sess-d", None)
            .await
            .unwrap();
        allocator
            .declare_files(assignment.id, &["src/store.rs".to_string()])
            .await
            .unwrap();
        allocator
            .runs()
            .advance_step(run.id, 1, StepOutcome::Done)
            .await
            .unwrap();
        (task.id, assignment.id, run.id)
    };

    // Reopen: migrations are idempotent and every row is still there.
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let allocator = Allocator::new(Arc::clone(&db), dir.path().join("worktrees"));

    let task = Backlog::new(Arc::clone(&db)).get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);

    let assignment = allocator.get(assignment_id).await.unwrap();
    assert_eq!(assignment.status, AssignmentStatus::InProgress);
    assert_eq!(assignment.run_id, Some(run_id));
    assert_eq!(assignment.file_manifest, vec!["src/store.rs".to_string()]);

    let run = allocator.runs().run_for_session("sess-d").await.unwrap();
    assert_eq!(run.id, run_id);
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.last_step_at.is_some());
    assert_eq!(allocator.runs().steps(run_id).await.unwrap().len(), 1);

    let holder = allocator.claims().holder("src/store.rs").await.unwrap().unwrap();
    assert_eq!(holder.assignment_id, Some(assignment_id));

    // The partial unique index still guards the live session after restart.
    let err = allocator
        .runs()
        .start_run(foreman::runs::StartRun::new("sess-d", "other"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), foreman::error::ErrorKind::Conflict);
}
