//! File claim model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An agent's exclusive hold on a file path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileClaim {
    pub id: Uuid,
    pub agent_id: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub claimed_at: DateTime<Utc>,
    /// `None` while the claim is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl FileClaim {
    pub fn new(agent_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            file_path: file_path.into(),
            assignment_id: None,
            description: None,
            claimed_at: Utc::now(),
            released_at: None,
        }
    }

    /// Builder: tie the claim to an assignment.
    pub fn for_assignment(mut self, assignment_id: Uuid) -> Self {
        self.assignment_id = Some(assignment_id);
        self
    }

    /// Builder: free-form note on why the file is held.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }

    /// Same agent and same assignment.
    pub fn same_owner(&self, other: &FileClaim) -> bool {
        self.agent_id == other.agent_id && self.assignment_id == other.assignment_id
    }
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimAttempt {
    /// No active claim existed; this one was inserted.
    Acquired(FileClaim),
    /// The same owner already holds the path.
    AlreadyHeld(FileClaim),
    /// Someone else holds the path.
    Conflict(FileClaim),
}

/// Normalize a path for claim comparison.
///
/// Strips a leading `./`, collapses duplicate separators and trailing slashes.
/// Paths are compared byte-wise after this.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    let mut out = String::with_capacity(trimmed.len());
    let mut prev_slash = false;
    for c in trimmed.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_noise() {
        assert_eq!(normalize_path("./src//main.rs"), "src/main.rs");
        assert_eq!(normalize_path("src/lib/"), "src/lib");
        assert_eq!(normalize_path("  x.py "), "x.py");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn owner_includes_assignment() {
        let assignment = Uuid::new_v4();
        let a = FileClaim::new("agent-a", "x.py").for_assignment(assignment);
        let b = FileClaim::new("agent-a", "x.py").for_assignment(assignment);
        let c = FileClaim::new("agent-a", "x.py");
        assert!(a.same_owner(&b));
        assert!(!a.same_owner(&c));
    }
}
