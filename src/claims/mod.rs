//! File claim manager: exclusive locks on logical file paths.
//!
//! A claim has no wall-clock expiry. Claims are released explicitly, when
//! their assignment finishes, or by `reconcile()` once the owning assignment
//! is terminal (crash recovery).

pub mod model;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClaimError, DatabaseError};
use crate::events::{EventKind, NewAgentEvent};
use crate::store::{Database, Mutation};

pub use model::{ClaimAttempt, FileClaim, normalize_path};

#[derive(Clone)]
pub struct FileClaimManager {
    db: Arc<dyn Database>,
}

impl FileClaimManager {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Claim a path with no assignment attached.
    pub async fn acquire(&self, agent_id: &str, file_path: &str) -> Result<FileClaim, ClaimError> {
        self.claim(FileClaim::new(agent_id, normalize_path(file_path)))
            .await
    }

    /// Claim a path on behalf of an assignment.
    pub async fn acquire_for_assignment(
        &self,
        agent_id: &str,
        file_path: &str,
        assignment_id: Uuid,
    ) -> Result<FileClaim, ClaimError> {
        self.claim(FileClaim::new(agent_id, normalize_path(file_path)).for_assignment(assignment_id))
            .await
    }

    /// Raw attempt, telling new acquisitions apart from re-acquisitions.
    pub async fn try_acquire(&self, mut claim: FileClaim) -> Result<ClaimAttempt, ClaimError> {
        claim.file_path = normalize_path(&claim.file_path);
        let attempt = self.db.try_claim(&claim).await?;
        match &attempt {
            ClaimAttempt::Acquired(c) => {
                debug!(agent_id = %c.agent_id, file_path = %c.file_path, "File claimed")
            }
            ClaimAttempt::AlreadyHeld(c) => {
                debug!(agent_id = %c.agent_id, file_path = %c.file_path, "File already held by caller")
            }
            ClaimAttempt::Conflict(holder) => debug!(
                file_path = %holder.file_path,
                holder = %holder.agent_id,
                requester = %claim.agent_id,
                "File claim conflict"
            ),
        }
        Ok(attempt)
    }

    async fn claim(&self, claim: FileClaim) -> Result<FileClaim, ClaimError> {
        match self.try_acquire(claim).await? {
            ClaimAttempt::Acquired(c) | ClaimAttempt::AlreadyHeld(c) => Ok(c),
            ClaimAttempt::Conflict(holder) => Err(ClaimError::Conflict {
                file_path: holder.file_path,
                holder: holder.agent_id,
            }),
        }
    }

    /// Retry `acquire` on conflict with jittered exponential backoff.
    ///
    /// Conflicts are the only retried error.
    pub async fn acquire_with_backoff(
        &self,
        agent_id: &str,
        file_path: &str,
        attempts: u32,
        base_delay: Duration,
    ) -> Result<FileClaim, ClaimError> {
        let attempts = attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.acquire(agent_id, file_path).await {
                Ok(claim) => return Ok(claim),
                Err(e) if e.kind().is_retryable() => {
                    if attempt + 1 < attempts {
                        let delay = backoff_delay(base_delay, attempt);
                        debug!(agent_id, file_path, attempt, delay_ms = delay.as_millis() as u64, "Claim busy, backing off");
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ClaimError::Conflict {
            file_path: normalize_path(file_path),
            holder: String::new(),
        }))
    }

    /// Release the agent's claim on a path.
    pub async fn release(&self, agent_id: &str, file_path: &str) -> Result<FileClaim, ClaimError> {
        let path = normalize_path(file_path);
        match self.db.release_claim(agent_id, &path, Utc::now()).await? {
            Some(claim) => {
                debug!(agent_id, file_path = %path, "File claim released");
                Ok(claim)
            }
            None => Err(ClaimError::NotHeld {
                file_path: path,
                agent_id: agent_id.to_string(),
            }),
        }
    }

    /// Release every active claim tied to an assignment. Returns how many were released.
    pub async fn release_assignment(&self, assignment_id: Uuid) -> Result<usize, ClaimError> {
        let held = self.db.list_active_claims_for_assignment(assignment_id).await?;
        if held.is_empty() {
            return Ok(0);
        }
        self.db
            .commit(&[Mutation::ReleaseAssignmentClaims {
                assignment_id,
                released_at: Utc::now(),
            }])
            .await?;
        debug!(assignment_id = %assignment_id, count = held.len(), "Assignment claims released");
        Ok(held.len())
    }

    pub async fn list_active(&self) -> Result<Vec<FileClaim>, ClaimError> {
        Ok(self.db.list_active_claims().await?)
    }

    /// Current holder of a path, if claimed.
    pub async fn holder(&self, file_path: &str) -> Result<Option<FileClaim>, ClaimError> {
        Ok(self.db.get_active_claim(&normalize_path(file_path)).await?)
    }

    /// Force-release claims whose owning assignment is terminal.
    ///
    /// Returns the number of claims released.
    pub async fn reconcile(&self) -> Result<usize, DatabaseError> {
        let orphaned = self.db.list_orphaned_claims().await?;
        let now = Utc::now();
        let mut released = 0;
        for claim in orphaned {
            if !self.db.release_claim_by_id(claim.id, now).await? {
                continue;
            }
            released += 1;
            warn!(
                agent_id = %claim.agent_id,
                file_path = %claim.file_path,
                assignment_id = ?claim.assignment_id,
                "Released orphaned file claim"
            );
            let event = NewAgentEvent::new(claim.agent_id.clone(), EventKind::ClaimReconciled)
                .with_detail(serde_json::json!({
                    "file_path": claim.file_path,
                    "claim_id": claim.id,
                    "assignment_id": claim.assignment_id,
                }))
                .at(now);
            if let Err(e) = self.db.append_event(&event).await {
                warn!(error = %e, "Failed to log claim reconciliation");
            }
        }
        if released > 0 {
            info!(released, "Claim reconciliation complete");
        }
        Ok(released)
    }
}

/// `base * 2^attempt`, capped at 32x, plus up to 50 % random jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(5);
    let delay = base.saturating_mul(factor);
    let jitter_cap = (delay.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
    delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn test_manager() -> (FileClaimManager, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (FileClaimManager::new(Arc::clone(&db)), db)
    }

    #[tokio::test]
    async fn conflict_names_holder() {
        let (claims, _) = test_manager().await;
        claims.acquire("agent-a", "src/x.py").await.unwrap();

        let err = claims.acquire("agent-b", "./src/x.py").await.unwrap_err();
        match err {
            ClaimError::Conflict { file_path, holder } => {
                assert_eq!(file_path, "src/x.py");
                assert_eq!(holder, "agent-a");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reacquire_by_same_owner_returns_existing() {
        let (claims, _) = test_manager().await;
        let first = claims.acquire("agent-a", "x.py").await.unwrap();
        let second = claims.acquire("agent-a", "x.py").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(claims.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_requires_holder() {
        let (claims, _) = test_manager().await;
        claims.acquire("agent-a", "x.py").await.unwrap();

        let err = claims.release("agent-b", "x.py").await.unwrap_err();
        assert!(matches!(err, ClaimError::NotHeld { .. }));

        claims.release("agent-a", "x.py").await.unwrap();
        assert!(claims.holder("x.py").await.unwrap().is_none());
        assert!(matches!(
            claims.release("agent-a", "x.py").await,
            Err(ClaimError::NotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn release_assignment_drops_only_its_claims() {
        let (claims, _) = test_manager().await;
        let assignment = Uuid::new_v4();
        claims.acquire_for_assignment("a", "x.py", assignment).await.unwrap();
        claims.acquire_for_assignment("a", "y.py", assignment).await.unwrap();
        claims.acquire("a", "z.py").await.unwrap();

        assert_eq!(claims.release_assignment(assignment).await.unwrap(), 2);
        let active: Vec<String> = claims
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.file_path)
            .collect();
        assert_eq!(active, vec!["z.py".to_string()]);
        assert_eq!(claims.release_assignment(assignment).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn backoff_gives_up_after_attempts() {
        let (claims, _) = test_manager().await;
        claims.acquire("agent-a", "x.py").await.unwrap();
        let err = claims
            .acquire_with_backoff("agent-b", "x.py", 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.kind().is_retryable());
    }

    #[tokio::test]
    async fn backoff_succeeds_once_released() {
        let (claims, _) = test_manager().await;
        claims.acquire("agent-a", "x.py").await.unwrap();

        let releaser = claims.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release("agent-a", "x.py").await.unwrap();
        });

        let claim = claims
            .acquire_with_backoff("agent-b", "x.py", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(claim.agent_id, "agent-b");
        handle.await.unwrap();
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        let base = Duration::from_millis(10);
        let first = backoff_delay(base, 0);
        assert!(first >= base && first <= base + Duration::from_millis(5));
        let capped = backoff_delay(base, 20);
        assert!(capped >= base * 32 && capped <= base * 48);
    }
}
