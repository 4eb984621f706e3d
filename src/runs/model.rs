//! Workflow, run and step models with their state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RunError;

/// A named, ordered sequence of step names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            steps,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Zombie classification of a run, independent of its lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZombieStatus {
    None,
    Suspected,
    Killed,
    /// Read from older rows only. Treated exactly like `None`.
    Pardoned,
}

impl ZombieStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Suspected => "suspected",
            Self::Killed => "killed",
            Self::Pardoned => "pardoned",
        }
    }

    /// `Pardoned` folded into `None`.
    pub fn normalized(self) -> Self {
        match self {
            Self::Pardoned => Self::None,
            other => other,
        }
    }

    /// Whether the zombie classification may move from `self` to `next`.
    ///
    /// `Killed` is absorbing.
    pub fn can_transition_to(&self, next: ZombieStatus) -> bool {
        use ZombieStatus::*;
        matches!(
            (self.normalized(), next.normalized()),
            (None, Suspected) | (None, Killed) | (Suspected, None) | (Suspected, Killed)
        )
    }
}

impl std::fmt::Display for ZombieStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ZombieStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Self::None),
            "suspected" => Ok(Self::Suspected),
            "killed" => Ok(Self::Killed),
            "pardoned" => Ok(Self::Pardoned),
            other => Err(format!("unknown zombie status: {other}")),
        }
    }
}

/// One execution attempt by an agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub session_key: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub status: RunStatus,
    pub zombie_status: ZombieStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Last time any step changed status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspected_at: Option<DateTime<Utc>>,
    /// Pardons reset the silence and stagnation clocks to this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pardoned_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Run {
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Reference point for the stagnation clock.
    pub fn progress_anchor(&self) -> DateTime<Utc> {
        [self.last_step_at, self.pardoned_at]
            .into_iter()
            .flatten()
            .fold(self.started_at, |acc, t| acc.max(t))
    }

    /// Copy with a new zombie classification, checked against the zombie
    /// transition table. Keeping the current classification is always allowed.
    pub fn zombie_moved_to(&self, next: ZombieStatus) -> Result<Run, RunError> {
        let current = self.zombie_status.normalized();
        if current != next.normalized() && !current.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                run_id: self.id,
                reason: format!("zombie status cannot move from {current} to {next}"),
            });
        }
        Ok(Run {
            zombie_status: next,
            ..self.clone()
        })
    }
}

/// Status of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Terminal result reported for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    Failed,
    Skipped,
}

impl From<StepOutcome> for StepStatus {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Done => StepStatus::Done,
            StepOutcome::Failed => StepStatus::Failed,
            StepOutcome::Skipped => StepStatus::Skipped,
        }
    }
}

/// Terminal result reported for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Failed => RunStatus::Failed,
        }
    }
}

/// A single ordered step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_order: i64,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn pending(run_id: Uuid, step_order: i64, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_order,
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Parameters for starting a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRun {
    pub session_key: String,
    pub agent_id: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
}

impl StartRun {
    pub fn new(session_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            agent_id: agent_id.into(),
            task_id: None,
            workflow_id: None,
        }
    }

    /// Builder: the task this run works on.
    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Builder: the workflow this run executes.
    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }
}

/// Step counts for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunProgress {
    pub fn from_steps(steps: &[Step]) -> Self {
        let mut progress = Self {
            total: steps.len(),
            ..Self::default()
        };
        for step in steps {
            match step.status {
                StepStatus::Pending => progress.pending += 1,
                StepStatus::Running => progress.running += 1,
                StepStatus::Done => progress.done += 1,
                StepStatus::Failed => progress.failed += 1,
                StepStatus::Skipped => progress.skipped += 1,
            }
        }
        progress
    }

    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killed_is_absorbing() {
        for next in [ZombieStatus::None, ZombieStatus::Suspected, ZombieStatus::Pardoned] {
            assert!(!ZombieStatus::Killed.can_transition_to(next));
        }
    }

    #[test]
    fn pardoned_behaves_like_none() {
        assert!(ZombieStatus::Pardoned.can_transition_to(ZombieStatus::Suspected));
        assert!(ZombieStatus::Pardoned.can_transition_to(ZombieStatus::Killed));
        assert_eq!(ZombieStatus::Pardoned.normalized(), ZombieStatus::None);
    }

    #[test]
    fn suspected_can_recover_or_die() {
        assert!(ZombieStatus::Suspected.can_transition_to(ZombieStatus::None));
        assert!(ZombieStatus::Suspected.can_transition_to(ZombieStatus::Killed));
        assert!(!ZombieStatus::Suspected.can_transition_to(ZombieStatus::Suspected));
    }

    fn running_run(started: DateTime<Utc>) -> Run {
        Run {
            id: Uuid::new_v4(),
            session_key: "s".into(),
            agent_id: "a".into(),
            task_id: None,
            workflow_id: None,
            status: RunStatus::Running,
            zombie_status: ZombieStatus::None,
            started_at: started,
            ended_at: None,
            last_step_at: None,
            suspected_at: None,
            pardoned_at: None,
            version: 0,
        }
    }

    #[test]
    fn zombie_moves_follow_the_table() {
        let run = running_run(Utc::now());
        let suspected = run.zombie_moved_to(ZombieStatus::Suspected).unwrap();
        assert_eq!(suspected.zombie_status, ZombieStatus::Suspected);
        assert!(suspected.zombie_moved_to(ZombieStatus::Suspected).is_ok());

        let killed = suspected.zombie_moved_to(ZombieStatus::Killed).unwrap();
        let err = killed.zombie_moved_to(ZombieStatus::None).unwrap_err();
        assert!(matches!(err, RunError::InvalidTransition { .. }));
        assert!(killed.zombie_moved_to(ZombieStatus::Suspected).is_err());
    }

    #[test]
    fn progress_anchor_uses_latest_signal() {
        let started = Utc::now() - chrono::Duration::minutes(30);
        let mut run = running_run(started);
        assert_eq!(run.progress_anchor(), started);

        let stepped = started + chrono::Duration::minutes(5);
        run.last_step_at = Some(stepped);
        assert_eq!(run.progress_anchor(), stepped);

        let pardoned = started + chrono::Duration::minutes(20);
        run.pardoned_at = Some(pardoned);
        assert_eq!(run.progress_anchor(), pardoned);
    }

    #[test]
    fn progress_counts_statuses() {
        let run_id = Uuid::new_v4();
        let mut steps: Vec<Step> = (1..=4).map(|i| Step::pending(run_id, i, format!("s{i}"))).collect();
        steps[0].status = StepStatus::Done;
        steps[1].status = StepStatus::Skipped;
        steps[2].status = StepStatus::Running;
        let progress = RunProgress::from_steps(&steps);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.done, 1);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.running, 1);
        assert_eq!(progress.pending, 1);
        assert!(!progress.all_terminal());
    }
}
