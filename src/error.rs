//! Error types for foreman.

use serde::Serialize;
use uuid::Uuid;

/// Coarse classification used by callers to decide whether to retry.
///
/// `Conflict` is recoverable (retry with backoff or pick another resource).
/// State-machine violations are caller bugs and are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    InvalidTransition,
    NotFound,
    OutOfOrder,
    /// The request itself is malformed or names something it may not.
    InvalidInput,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Conflict)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::InvalidTransition => "invalid_transition",
            Self::NotFound => "not_found",
            Self::OutOfOrder => "out_of_order",
            Self::InvalidInput => "invalid_input",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Backlog error: {0}")]
    Backlog(#[from] BacklogError),

    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    #[error("Assignment error: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Unauthorized: {action} requires operator privileges")]
    Unauthorized { action: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Database(_) => ErrorKind::Internal,
            Self::Backlog(e) => e.kind(),
            Self::Claim(e) => e.kind(),
            Self::Assignment(e) => e.kind(),
            Self::Run(e) => e.kind(),
            Self::Event(e) => e.kind(),
            Self::Ledger(e) => e.kind(),
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Map a libSQL error, surfacing unique-index violations as `Constraint`.
    pub(crate) fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("UNIQUE constraint failed") {
            Self::Constraint(format!("{context}: {message}"))
        } else {
            Self::Query(format!("{context}: {message}"))
        }
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// Backlog ingestion and ranking errors.
#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Task {id} was modified concurrently")]
    Stale { id: Uuid },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl BacklogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Stale { .. } => ErrorKind::Conflict,
            Self::Database(_) => ErrorKind::Internal,
        }
    }
}

/// File claim errors.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("{file_path} is already claimed by {holder}")]
    Conflict { file_path: String, holder: String },

    #[error("{agent_id} holds no active claim on {file_path}")]
    NotHeld { file_path: String, agent_id: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl ClaimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotHeld { .. } => ErrorKind::NotFound,
            Self::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Task assignment errors.
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Assignment {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {task_id} already has live assignment {assignment_id}")]
    TaskAlreadyAssigned { task_id: Uuid, assignment_id: Uuid },

    #[error("Assignment {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Files already claimed: {}", paths.join(", "))]
    FileConflict { paths: Vec<String> },

    #[error("Assignment {id} was modified concurrently")]
    Stale { id: Uuid },

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl AssignmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound { .. } | Self::NotFound { .. } => ErrorKind::NotFound,
            Self::TaskAlreadyAssigned { .. } | Self::FileConflict { .. } | Self::Stale { .. } => {
                ErrorKind::Conflict
            }
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Claim(e) => e.kind(),
            Self::Run(e) => e.kind(),
            Self::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Run/step state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Run {id} not found")]
    NotFound { id: Uuid },

    #[error("No run found for session {session_key}")]
    SessionNotFound { session_key: String },

    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: Uuid },

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Session {session_key} already has an active run")]
    SessionActive { session_key: String },

    #[error("Workflow {name} is referenced by runs and cannot be redefined")]
    WorkflowReferenced { name: String },

    #[error("Step {order} of run {run_id} is out of order: {reason}")]
    OutOfOrder {
        run_id: Uuid,
        order: i64,
        reason: String,
    },

    #[error("Run {run_id} is already {status}")]
    RunTerminal { run_id: Uuid, status: String },

    #[error("Run {run_id}: {reason}")]
    InvalidTransition { run_id: Uuid, reason: String },

    #[error("Run {id} was modified concurrently")]
    Stale { id: Uuid },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. }
            | Self::SessionNotFound { .. }
            | Self::WorkflowNotFound { .. }
            | Self::TaskNotFound { .. } => ErrorKind::NotFound,
            Self::SessionActive { .. } | Self::WorkflowReferenced { .. } | Self::Stale { .. } => {
                ErrorKind::Conflict
            }
            Self::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            Self::RunTerminal { .. } | Self::InvalidTransition { .. } => {
                ErrorKind::InvalidTransition
            }
            Self::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Event ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event kind {kind} is reserved for the coordinator")]
    ReservedKind { kind: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl EventError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReservedKind { .. } => ErrorKind::InvalidInput,
            Self::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Budget and rate ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("No budget configured for {agent_id}")]
    BudgetNotFound { agent_id: String },

    #[error("Invalid budget for {agent_id}: {reason}")]
    InvalidBudget { agent_id: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BudgetNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidBudget { .. } => ErrorKind::InvalidInput,
            Self::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
