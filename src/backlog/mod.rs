//! Backlog: task ingestion and priority ranking.
//!
//! Tasks enter as `backlog`, may be promoted to `planned` or `queued`, and
//! are handed out in rank order. Statuses past `queued` belong to the
//! allocator.

pub mod model;

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::BacklogError;
use crate::store::{CommitOutcome, Database, Mutation};

pub use model::{Task, TaskStatus};

#[derive(Clone)]
pub struct Backlog {
    db: Arc<dyn Database>,
}

impl Backlog {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Add a task. Anything other than `planned`/`queued` enters as `backlog`.
    pub async fn ingest(&self, task: Task) -> Result<Task, BacklogError> {
        let status = match task.status {
            TaskStatus::Planned | TaskStatus::Queued => task.status,
            _ => TaskStatus::Backlog,
        };
        let task = Task {
            status,
            version: 0,
            updated_at: Utc::now(),
            ..task
        };
        self.db.insert_task(&task).await?;
        info!(task_id = %task.id, title = %task.title, status = %task.status, priority = task.priority, "Task ingested");
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, BacklogError> {
        self.db
            .get_task(id)
            .await?
            .ok_or(BacklogError::TaskNotFound { id })
    }

    /// Move a waiting task to `planned` or `queued`.
    ///
    /// Promoting to the current status is a no-op.
    pub async fn promote(&self, id: Uuid, target: TaskStatus) -> Result<Task, BacklogError> {
        let task = self.get(id).await?;
        if task.status == target {
            return Ok(task);
        }
        let allowed = matches!(target, TaskStatus::Planned | TaskStatus::Queued)
            && task.status.is_assignable();
        if !allowed {
            return Err(BacklogError::InvalidTransition {
                id,
                from: task.status.to_string(),
                to: target.to_string(),
            });
        }

        let updated = task.moved_to(target);
        match self.db.commit(&[Mutation::SaveTask(updated.clone())]).await? {
            CommitOutcome::Committed => {
                info!(task_id = %id, from = %task.status, to = %target, "Task promoted");
                Ok(Task {
                    version: task.version + 1,
                    ..updated
                })
            }
            CommitOutcome::Stale { .. } => Err(BacklogError::Stale { id }),
        }
    }

    /// Queued tasks in the order they should be picked up:
    /// priority (lower first), then age (older first), then id.
    pub async fn next_eligible(&self, limit: usize) -> Result<Vec<Task>, BacklogError> {
        Ok(self.db.list_tasks_by_status(TaskStatus::Queued, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn test_backlog() -> Backlog {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Backlog::new(db)
    }

    #[tokio::test]
    async fn ingest_defaults_to_backlog() {
        let backlog = test_backlog().await;
        let task = backlog
            .ingest(Task::new("t").with_status(TaskStatus::Running))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Backlog);

        let queued = backlog
            .ingest(Task::new("q").with_status(TaskStatus::Queued))
            .await
            .unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn promote_moves_waiting_tasks_only() {
        let backlog = test_backlog().await;
        let task = backlog.ingest(Task::new("t")).await.unwrap();

        let planned = backlog.promote(task.id, TaskStatus::Planned).await.unwrap();
        assert_eq!(planned.status, TaskStatus::Planned);
        let queued = backlog.promote(task.id, TaskStatus::Queued).await.unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
        assert_eq!(queued.version, 2);

        let err = backlog.promote(task.id, TaskStatus::Done).await.unwrap_err();
        assert!(matches!(err, BacklogError::InvalidTransition { .. }));

        let missing = backlog.promote(Uuid::new_v4(), TaskStatus::Queued).await.unwrap_err();
        assert!(matches!(missing, BacklogError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn next_eligible_ranks_priority_then_age() {
        let backlog = test_backlog().await;
        let base = Utc::now() - chrono::Duration::hours(1);
        let queued = |title: &str, priority: i32, age_mins: i64| {
            let mut task = Task::new(title)
                .with_priority(priority)
                .with_status(TaskStatus::Queued);
            task.created_at = base - chrono::Duration::minutes(age_mins);
            task
        };

        let low = backlog.ingest(queued("low", 5, 60)).await.unwrap();
        let urgent_old = backlog.ingest(queued("urgent-old", 1, 30)).await.unwrap();
        let urgent_new = backlog.ingest(queued("urgent-new", 1, 10)).await.unwrap();
        backlog.ingest(Task::new("not queued").with_priority(0)).await.unwrap();

        let ranked = backlog.next_eligible(10).await.unwrap();
        let ids: Vec<Uuid> = ranked.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![urgent_old.id, urgent_new.id, low.id]);

        assert_eq!(backlog.next_eligible(1).await.unwrap().len(), 1);
    }
}
