//! Unified `Database` trait: single async interface for all persistence.
//!
//! Three logical namespaces live behind it: work tracking (tasks, workflows,
//! runs, steps, assignments), concurrency (file claims) and telemetry
//! (agent events, usage, rate-limit windows, budgets).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::assignments::model::TaskAssignment;
use crate::backlog::model::{Task, TaskStatus};
use crate::claims::model::{ClaimAttempt, FileClaim};
use crate::error::DatabaseError;
use crate::events::model::{AgentEvent, EventKind, NewAgentEvent};
use crate::ledger::budget::AgentBudget;
use crate::ledger::model::{RateLimitWindow, UsageRecord, UsageSummary};
use crate::runs::model::{Run, RunStatus, Step, Workflow};

/// One write inside a unit of work.
///
/// `Save*` variants carry the entity as it should look after the write, with
/// `version` still set to the value that was read. The row is only updated
/// if its stored version still matches; the stored version is then bumped.
#[derive(Debug, Clone)]
pub enum Mutation {
    SaveTask(Task),
    InsertAssignment(TaskAssignment),
    SaveAssignment(TaskAssignment),
    SaveRun(Run),
    InsertStep(Step),
    SaveStep(Step),
    /// Release every active claim tied to an assignment.
    ReleaseAssignmentClaims {
        assignment_id: Uuid,
        released_at: DateTime<Utc>,
    },
    AppendEvent(NewAgentEvent),
}

/// Result of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every mutation applied.
    Committed,
    /// A versioned row changed underneath the caller; nothing was applied.
    Stale { entity: &'static str, id: Uuid },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Apply mutations atomically.
    ///
    /// Unique-index violations roll back and surface as
    /// `DatabaseError::Constraint`.
    async fn commit(&self, mutations: &[Mutation]) -> Result<CommitOutcome, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Tasks in a status, ranked by priority, then age, then id.
    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    // ── Workflows ───────────────────────────────────────────────────

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), DatabaseError>;

    /// Replace the step plan and description of an existing workflow, version-checked.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<CommitOutcome, DatabaseError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, DatabaseError>;

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, DatabaseError>;

    /// Whether any run references the workflow.
    async fn workflow_in_use(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Runs & steps ────────────────────────────────────────────────

    /// Insert a run together with its pre-created steps and an event.
    ///
    /// A second running run for the same session key violates
    /// `idx_runs_active_session` and comes back as `Constraint`.
    async fn insert_run(
        &self,
        run: &Run,
        steps: &[Step],
        event: &NewAgentEvent,
    ) -> Result<(), DatabaseError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, DatabaseError>;

    /// The running run for a session key, if any.
    async fn get_active_run_by_session(
        &self,
        session_key: &str,
    ) -> Result<Option<Run>, DatabaseError>;

    /// Most recently started run for a session key, in any status.
    async fn get_latest_run_by_session(
        &self,
        session_key: &str,
    ) -> Result<Option<Run>, DatabaseError>;

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, DatabaseError>;

    /// Steps of a run ordered by `step_order`.
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, DatabaseError>;

    // ── Assignments ─────────────────────────────────────────────────

    async fn get_assignment(&self, id: Uuid) -> Result<Option<TaskAssignment>, DatabaseError>;

    async fn get_live_assignment_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Option<TaskAssignment>, DatabaseError>;

    async fn get_live_assignment_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Option<TaskAssignment>, DatabaseError>;

    async fn list_live_assignments(&self) -> Result<Vec<TaskAssignment>, DatabaseError>;

    // ── File claims ─────────────────────────────────────────────────

    /// Atomically claim `claim.file_path`.
    async fn try_claim(&self, claim: &FileClaim) -> Result<ClaimAttempt, DatabaseError>;

    /// Release the agent's active claim on a path. `None` if it held none.
    async fn release_claim(
        &self,
        agent_id: &str,
        file_path: &str,
        released_at: DateTime<Utc>,
    ) -> Result<Option<FileClaim>, DatabaseError>;

    /// Release a claim by id. `false` if it was already released.
    async fn release_claim_by_id(
        &self,
        id: Uuid,
        released_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn get_active_claim(&self, file_path: &str) -> Result<Option<FileClaim>, DatabaseError>;

    async fn list_active_claims(&self) -> Result<Vec<FileClaim>, DatabaseError>;

    async fn list_active_claims_for_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Vec<FileClaim>, DatabaseError>;

    /// Active claims whose owning assignment has reached a terminal status.
    async fn list_orphaned_claims(&self) -> Result<Vec<FileClaim>, DatabaseError>;

    // ── Agent events ────────────────────────────────────────────────

    /// Append an event, returning its row id. `created_at` must be set.
    async fn append_event(&self, event: &NewAgentEvent) -> Result<i64, DatabaseError>;

    /// Latest `created_at` for a session, ignoring the given kinds.
    async fn last_event_at(
        &self,
        session_key: &str,
        exclude: &[EventKind],
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Most recent events of a session, newest first, optionally filtered by kind.
    async fn recent_events(
        &self,
        session_key: &str,
        kind: Option<&EventKind>,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, DatabaseError>;

    // ── Ledger ──────────────────────────────────────────────────────

    async fn insert_rate_limit(&self, window: &RateLimitWindow) -> Result<(), DatabaseError>;

    /// Newest observation per metric type for a provider.
    async fn latest_rate_limits(
        &self,
        provider: &str,
    ) -> Result<Vec<RateLimitWindow>, DatabaseError>;

    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), DatabaseError>;

    /// Usage of a session, optionally limited to records at or after `since`.
    ///
    /// Includes token counts carried directly on agent events.
    async fn usage_summary(
        &self,
        session_key: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, DatabaseError>;

    /// Spend attributed to an agent at or after `since`: usage records of
    /// every session the agent ran, plus costs on its own events.
    async fn agent_spend_since(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError>;

    // ── Budgets ─────────────────────────────────────────────────────

    /// Insert or replace an agent's budget.
    async fn upsert_budget(&self, budget: &AgentBudget) -> Result<(), DatabaseError>;

    async fn get_budget(&self, agent_id: &str) -> Result<Option<AgentBudget>, DatabaseError>;

    async fn list_budgets(&self) -> Result<Vec<AgentBudget>, DatabaseError>;
}
