//! Task assignment model and its lifecycle.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an assignment.
///
/// ```text
/// assigned → in_progress → review → merging → merged
///                 │           │         └───→ failed
///                 └───────────┴──────────────→ failed
/// any non-terminal ──────────────────────────→ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    InProgress,
    Review,
    Merging,
    Merged,
    Failed,
    Cancelled,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Assigned, InProgress)
                | (InProgress, Review)
                | (Review, Merging)
                | (Merging, Merged)
                | (Merging, Failed)
        )
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssignmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "merging" => Ok(Self::Merging),
            "merged" => Ok(Self::Merged),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown assignment status: {other}")),
        }
    }
}

/// How an assignment finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Merged,
    Failed,
    Cancelled,
}

impl From<AssignmentOutcome> for AssignmentStatus {
    fn from(outcome: AssignmentOutcome) -> Self {
        match outcome {
            AssignmentOutcome::Merged => AssignmentStatus::Merged,
            AssignmentOutcome::Failed => AssignmentStatus::Failed,
            AssignmentOutcome::Cancelled => AssignmentStatus::Cancelled,
        }
    }
}

/// The binding of a task to an agent, a repo branch and an isolated worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub repo: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub description: String,
    /// Files the agent declared it will touch.
    pub file_manifest: Vec<String>,
    pub status: AssignmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskAssignment {
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Request to bind a task to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub task_id: Uuid,
    pub agent_id: String,
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    /// Overrides `<worktree_root>/<repo>/<branch>`.
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
}

impl AssignRequest {
    pub fn new(
        task_id: Uuid,
        agent_id: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            repo: repo.into(),
            branch: branch.into(),
            description: None,
            parent_task_id: None,
            worktree_path: None,
        }
    }

    /// Builder: what the agent should do.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder: use an explicit worktree path.
    pub fn with_worktree(mut self, path: impl Into<PathBuf>) -> Self {
        self.worktree_path = Some(path.into());
        self
    }

    /// Builder: mark as a sub-task of another task.
    pub fn with_parent(mut self, parent_task_id: Uuid) -> Self {
        self.parent_task_id = Some(parent_task_id);
        self
    }
}
