//! Event log: append-only agent telemetry.
//!
//! Every lifecycle change, tool call and supervision decision lands here.
//! Timestamps are assigned by the coordinator: a pushed event that claims to
//! come from further in the future than the skew tolerance is clamped to now.

pub mod model;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{DatabaseError, EventError};
use crate::store::Database;

pub use model::{AgentEvent, EventKind, NewAgentEvent, SUPERVISORY_KINDS};

/// Kinds that never count toward a session's last activity.
fn non_activity_kinds() -> Vec<EventKind> {
    let mut kinds = vec![EventKind::Heartbeat];
    kinds.extend(SUPERVISORY_KINDS.iter().cloned());
    kinds
}

/// Append/read facade over the `agent_events` table.
#[derive(Clone)]
pub struct EventLog {
    db: Arc<dyn Database>,
    skew_tolerance: Duration,
}

impl EventLog {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            skew_tolerance: Duration::from_secs(120),
        }
    }

    /// Builder: how far into the future a producer timestamp may point.
    pub fn with_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.skew_tolerance = tolerance;
        self
    }

    /// Fill in or clamp `created_at` relative to `now`.
    pub fn stamp(&self, mut event: NewAgentEvent, now: DateTime<Utc>) -> NewAgentEvent {
        let tolerance = chrono::Duration::from_std(self.skew_tolerance)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        match event.created_at {
            Some(at) if at > now + tolerance => {
                warn!(
                    agent_id = %event.agent_id,
                    kind = %event.kind,
                    claimed = %at,
                    "Event timestamp too far in the future, clamping to now"
                );
                event.created_at = Some(now);
            }
            Some(_) => {}
            None => event.created_at = Some(now),
        }
        event
    }

    /// Append an event, returning its row id.
    pub async fn append(&self, event: NewAgentEvent) -> Result<i64, DatabaseError> {
        let event = self.stamp(event, Utc::now());
        let id = self.db.append_event(&event).await?;
        debug!(
            event_id = id,
            session_key = event.session_key.as_deref().unwrap_or("-"),
            kind = %event.kind,
            "Event appended"
        );
        Ok(id)
    }

    /// Append an event reported by an agent runtime.
    ///
    /// Supervisory kinds are written only by the coordinator and are refused.
    pub async fn ingest(&self, event: NewAgentEvent) -> Result<i64, EventError> {
        if SUPERVISORY_KINDS.contains(&event.kind) {
            warn!(
                agent_id = %event.agent_id,
                kind = %event.kind,
                "Rejected reserved event kind from producer"
            );
            return Err(EventError::ReservedKind {
                kind: event.kind.as_str().to_string(),
            });
        }
        Ok(self.append(event).await?)
    }

    /// Latest agent activity for a session. Heartbeats and supervision
    /// events are ignored.
    pub async fn last_activity(
        &self,
        session_key: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        self.db
            .last_event_at(session_key, &non_activity_kinds())
            .await
    }

    /// Latest heartbeat for a session.
    pub async fn last_heartbeat(
        &self,
        session_key: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let latest = self
            .db
            .recent_events(session_key, Some(&EventKind::Heartbeat), 1)
            .await?;
        Ok(latest.first().map(|e| e.created_at))
    }

    /// Most recent events of a session, newest first.
    pub async fn recent(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, DatabaseError> {
        self.db.recent_events(session_key, None, limit).await
    }

    /// Most recent events of one kind, newest first.
    pub async fn recent_of_kind(
        &self,
        session_key: &str,
        kind: &EventKind,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, DatabaseError> {
        self.db.recent_events(session_key, Some(kind), limit).await
    }
}
