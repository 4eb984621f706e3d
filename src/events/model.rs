//! Agent event model: the append-only telemetry record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Type tag of an agent event.
///
/// The agent runtime may report kinds this crate does not know about; those
/// round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// Liveness ping. Proves the process is up, not that it is productive.
    Heartbeat,
    ToolCall,
    Output,
    RunStarted,
    RunCompleted,
    RunFailed,
    StepStarted,
    StepDone,
    StepFailed,
    StepSkipped,
    TaskAssigned,
    AssignmentTransition,
    FilesDeclared,
    ZombieCheck,
    TaskKill,
    ZombiePardon,
    ClaimReconciled,
    Other(String),
}

/// Kinds written by the coordinator itself while supervising a session.
///
/// These never count as agent activity.
pub const SUPERVISORY_KINDS: &[EventKind] = &[
    EventKind::ZombieCheck,
    EventKind::TaskKill,
    EventKind::ZombiePardon,
    EventKind::ClaimReconciled,
];

impl EventKind {
    /// Whether this kind is evidence that the agent did something.
    pub fn is_activity(&self) -> bool {
        !matches!(self, Self::Heartbeat) && !SUPERVISORY_KINDS.contains(self)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::ToolCall => "tool_call",
            Self::Output => "output",
            Self::RunStarted => "run_started",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::StepStarted => "step_started",
            Self::StepDone => "step_done",
            Self::StepFailed => "step_failed",
            Self::StepSkipped => "step_skipped",
            Self::TaskAssigned => "task_assigned",
            Self::AssignmentTransition => "assignment_transition",
            Self::FilesDeclared => "files_declared",
            Self::ZombieCheck => "zombie_check",
            Self::TaskKill => "task_kill",
            Self::ZombiePardon => "zombie_pardon",
            Self::ClaimReconciled => "claim_reconciled",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "heartbeat" => Self::Heartbeat,
            "tool_call" => Self::ToolCall,
            "output" => Self::Output,
            "run_started" => Self::RunStarted,
            "run_completed" => Self::RunCompleted,
            "run_failed" => Self::RunFailed,
            "step_started" => Self::StepStarted,
            "step_done" => Self::StepDone,
            "step_failed" => Self::StepFailed,
            "step_skipped" => Self::StepSkipped,
            "task_assigned" => Self::TaskAssigned,
            "assignment_transition" => Self::AssignmentTransition,
            "files_declared" => Self::FilesDeclared,
            "zombie_check" => Self::ZombieCheck,
            "task_kill" => Self::TaskKill,
            "zombie_pardon" => Self::ZombiePardon,
            "claim_reconciled" => Self::ClaimReconciled,
            _ => Self::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted agent event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Monotonic row id.
    pub id: i64,
    /// Session the event belongs to, if any.
    pub session_key: Option<String>,
    pub agent_id: String,
    pub kind: EventKind,
    pub detail: serde_json::Value,
    pub tokens_used: Option<i64>,
    pub cost_usd: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl AgentEvent {
    /// The `output` field of the detail payload, used by the repetition check.
    pub fn output_text(&self) -> &str {
        self.detail
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

/// An event about to be appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgentEvent {
    #[serde(default)]
    pub session_key: Option<String>,
    pub agent_id: String,
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    #[serde(default)]
    pub detail: serde_json::Value,
    #[serde(default)]
    pub tokens_used: Option<i64>,
    #[serde(default)]
    pub cost_usd: Option<Decimal>,
    /// Producer timestamp; the log stamps `now` when absent.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewAgentEvent {
    pub fn new(agent_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            session_key: None,
            agent_id: agent_id.into(),
            kind,
            detail: serde_json::Value::Object(Default::default()),
            tokens_used: None,
            cost_usd: None,
            created_at: None,
        }
    }

    /// Builder: attach to a session.
    pub fn for_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    /// Builder: set the detail payload.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Builder: record token usage carried by the event.
    pub fn with_tokens(mut self, tokens: i64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    /// Builder: record spend carried by the event.
    pub fn with_cost(mut self, cost_usd: Decimal) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    /// Builder: explicit timestamp.
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_round_trip() {
        for raw in ["heartbeat", "zombie_check", "task_kill", "zombie_pardon", "step_done"] {
            let kind = EventKind::from(raw.to_string());
            assert!(!matches!(kind, EventKind::Other(_)), "{raw} should be known");
            assert_eq!(kind.as_str(), raw);
        }
    }

    #[test]
    fn heartbeats_and_supervision_are_not_activity() {
        assert!(!EventKind::Heartbeat.is_activity());
        assert!(!EventKind::ZombieCheck.is_activity());
        assert!(!EventKind::ZombiePardon.is_activity());
        assert!(EventKind::ToolCall.is_activity());
        assert!(EventKind::StepDone.is_activity());
        assert!(EventKind::Other("custom".into()).is_activity());
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let kind = EventKind::from("model_switch".to_string());
        assert_eq!(kind, EventKind::Other("model_switch".into()));
        assert_eq!(String::from(kind), "model_switch");
    }

    #[test]
    fn new_event_deserializes_from_runtime_payload() {
        let json = serde_json::json!({
            "agent_id": "coder-1",
            "session_key": "sess-1",
            "event_type": "tool_call",
            "detail": {"tool": "shell", "args": "ls"}
        });
        let event: NewAgentEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.kind, EventKind::ToolCall);
        assert_eq!(event.session_key.as_deref(), Some("sess-1"));
        assert!(event.created_at.is_none());
    }
}
