//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every statement, read or
//! write, runs under `lock`: the connection is shared, so an open
//! transaction would otherwise absorb unrelated writes from other tasks and
//! let their reads see rows it has not committed yet.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assignments::model::{AssignmentStatus, TaskAssignment};
use crate::backlog::model::{Task, TaskStatus};
use crate::claims::model::{ClaimAttempt, FileClaim};
use crate::error::DatabaseError;
use crate::events::model::{AgentEvent, EventKind, NewAgentEvent};
use crate::ledger::budget::AgentBudget;
use crate::ledger::model::{MetricType, RateLimitWindow, UsageRecord, UsageSummary};
use crate::runs::model::{Run, RunStatus, Step, StepStatus, Workflow, ZombieStatus};
use crate::store::migrations;
use crate::store::traits::{CommitOutcome, Database, Mutation};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Hold for the whole statement, including draining its rows.
    async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width RFC 3339 so text order is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(&dt)),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>`-like values to a libsql Value.
fn opt_text(s: Option<impl Into<String>>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.into()),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    opt_text(id.map(|id| id.to_string()))
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn text(row: &libsql::Row, idx: i32, ctx: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{ctx}[{idx}]: {e}")))
}

fn opt_text_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok().filter(|s| !s.is_empty())
}

fn int(row: &libsql::Row, idx: i32, ctx: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{ctx}[{idx}]: {e}")))
}

fn uuid_col(row: &libsql::Row, idx: i32, ctx: &str) -> Result<Uuid, DatabaseError> {
    let raw = text(row, idx, ctx)?;
    Uuid::parse_str(&raw).map_err(|e| DatabaseError::Serialization(format!("{ctx} id: {e}")))
}

fn opt_uuid_col(row: &libsql::Row, idx: i32) -> Option<Uuid> {
    opt_text_col(row, idx).and_then(|s| Uuid::parse_str(&s).ok())
}

fn ts_col(row: &libsql::Row, idx: i32, ctx: &str) -> Result<DateTime<Utc>, DatabaseError> {
    Ok(parse_datetime(&text(row, idx, ctx)?))
}

fn opt_ts_col(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    opt_text_col(row, idx).map(|s| parse_datetime(&s))
}

fn decimal(raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or(Decimal::ZERO)
}

fn parse_enum<T>(raw: &str, ctx: &str) -> Result<T, DatabaseError>
where
    T: FromStr<Err = String>,
{
    raw.parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("{ctx}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, ctx: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(format!("{ctx}: {e}")))
}

const LIVE_ASSIGNMENT_STATUSES: &str = "('assigned', 'in_progress', 'review', 'merging')";
const TERMINAL_ASSIGNMENT_STATUSES: &str = "('merged', 'failed', 'cancelled')";

// ── Row mapping ─────────────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "id, title, description, status, priority, epic, project, version, created_at, updated_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    Ok(Task {
        id: uuid_col(row, 0, "task")?,
        title: text(row, 1, "task")?,
        description: opt_text_col(row, 2),
        status: parse_enum::<TaskStatus>(&text(row, 3, "task")?, "task.status")?,
        priority: int(row, 4, "task")? as i32,
        epic: opt_text_col(row, 5),
        project: opt_text_col(row, 6),
        version: int(row, 7, "task")?,
        created_at: ts_col(row, 8, "task")?,
        updated_at: ts_col(row, 9, "task")?,
    })
}

const WORKFLOW_COLUMNS: &str = "id, name, description, steps, version, created_at, updated_at";

fn row_to_workflow(row: &libsql::Row) -> Result<Workflow, DatabaseError> {
    let steps_raw = text(row, 3, "workflow")?;
    let steps: Vec<String> = serde_json::from_str(&steps_raw)
        .map_err(|e| DatabaseError::Serialization(format!("workflow.steps: {e}")))?;
    Ok(Workflow {
        id: uuid_col(row, 0, "workflow")?,
        name: text(row, 1, "workflow")?,
        description: opt_text_col(row, 2),
        steps,
        version: int(row, 4, "workflow")?,
        created_at: ts_col(row, 5, "workflow")?,
        updated_at: ts_col(row, 6, "workflow")?,
    })
}

const RUN_COLUMNS: &str = "id, session_key, agent_id, task_id, workflow_id, status, zombie_status, started_at, ended_at, last_step_at, suspected_at, pardoned_at, version";

fn row_to_run(row: &libsql::Row) -> Result<Run, DatabaseError> {
    Ok(Run {
        id: uuid_col(row, 0, "run")?,
        session_key: text(row, 1, "run")?,
        agent_id: text(row, 2, "run")?,
        task_id: opt_uuid_col(row, 3),
        workflow_id: opt_uuid_col(row, 4),
        status: parse_enum::<RunStatus>(&text(row, 5, "run")?, "run.status")?,
        zombie_status: parse_enum::<ZombieStatus>(
            &opt_text_col(row, 6).unwrap_or_default(),
            "run.zombie_status",
        )?,
        started_at: ts_col(row, 7, "run")?,
        ended_at: opt_ts_col(row, 8),
        last_step_at: opt_ts_col(row, 9),
        suspected_at: opt_ts_col(row, 10),
        pardoned_at: opt_ts_col(row, 11),
        version: int(row, 12, "run")?,
    })
}

const STEP_COLUMNS: &str = "id, run_id, step_order, name, status, started_at, completed_at";

fn row_to_step(row: &libsql::Row) -> Result<Step, DatabaseError> {
    Ok(Step {
        id: uuid_col(row, 0, "step")?,
        run_id: uuid_col(row, 1, "step")?,
        step_order: int(row, 2, "step")?,
        name: text(row, 3, "step")?,
        status: parse_enum::<StepStatus>(&text(row, 4, "step")?, "step.status")?,
        started_at: opt_ts_col(row, 5),
        completed_at: opt_ts_col(row, 6),
    })
}

const ASSIGNMENT_COLUMNS: &str = "id, task_id, agent_id, repo, branch, worktree_path, description, file_manifest, status, parent_task_id, run_id, version, created_at, started_at, completed_at";

fn row_to_assignment(row: &libsql::Row) -> Result<TaskAssignment, DatabaseError> {
    let manifest_raw = opt_text_col(row, 7).unwrap_or_else(|| "[]".to_string());
    let file_manifest: Vec<String> = serde_json::from_str(&manifest_raw)
        .map_err(|e| DatabaseError::Serialization(format!("assignment.file_manifest: {e}")))?;
    Ok(TaskAssignment {
        id: uuid_col(row, 0, "assignment")?,
        task_id: uuid_col(row, 1, "assignment")?,
        agent_id: text(row, 2, "assignment")?,
        repo: text(row, 3, "assignment")?,
        branch: text(row, 4, "assignment")?,
        worktree_path: text(row, 5, "assignment")?.into(),
        description: opt_text_col(row, 6).unwrap_or_default(),
        file_manifest,
        status: parse_enum::<AssignmentStatus>(&text(row, 8, "assignment")?, "assignment.status")?,
        parent_task_id: opt_uuid_col(row, 9),
        run_id: opt_uuid_col(row, 10),
        version: int(row, 11, "assignment")?,
        created_at: ts_col(row, 12, "assignment")?,
        started_at: opt_ts_col(row, 13),
        completed_at: opt_ts_col(row, 14),
    })
}

const CLAIM_COLUMNS: &str =
    "id, agent_id, file_path, assignment_id, description, claimed_at, released_at";

fn row_to_claim(row: &libsql::Row) -> Result<FileClaim, DatabaseError> {
    Ok(FileClaim {
        id: uuid_col(row, 0, "claim")?,
        agent_id: text(row, 1, "claim")?,
        file_path: text(row, 2, "claim")?,
        assignment_id: opt_uuid_col(row, 3),
        description: opt_text_col(row, 4),
        claimed_at: ts_col(row, 5, "claim")?,
        released_at: opt_ts_col(row, 6),
    })
}

const EVENT_COLUMNS: &str =
    "id, session_key, agent_id, event_type, detail, tokens_used, cost_usd, created_at";

fn row_to_event(row: &libsql::Row) -> Result<AgentEvent, DatabaseError> {
    let detail = opt_text_col(row, 4)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null);
    Ok(AgentEvent {
        id: int(row, 0, "event")?,
        session_key: opt_text_col(row, 1),
        agent_id: text(row, 2, "event")?,
        kind: EventKind::from(text(row, 3, "event")?),
        detail,
        tokens_used: row.get::<i64>(5).ok(),
        cost_usd: opt_text_col(row, 6).map(|s| decimal(&s)),
        created_at: ts_col(row, 7, "event")?,
    })
}

const RATE_LIMIT_COLUMNS: &str =
    "provider, metric_type, limit_value, remaining, reset_at, recorded_at, used";

fn row_to_rate_limit(row: &libsql::Row) -> Result<RateLimitWindow, DatabaseError> {
    let limit = int(row, 2, "rate_limit")?;
    let remaining = int(row, 3, "rate_limit")?;
    Ok(RateLimitWindow {
        provider: text(row, 0, "rate_limit")?,
        metric_type: parse_enum::<MetricType>(&text(row, 1, "rate_limit")?, "metric_type")?,
        // Rows written before `used` was stored carry NULL.
        used: row
            .get::<i64>(6)
            .unwrap_or_else(|_| (limit - remaining).max(0)),
        limit,
        remaining,
        reset_at: opt_ts_col(row, 4),
        recorded_at: ts_col(row, 5, "rate_limit")?,
    })
}

const BUDGET_COLUMNS: &str = "agent_id, daily_limit_cents, weekly_limit_cents, monthly_limit_cents, alert_threshold, paused, paused_at, paused_reason, updated_at";

fn row_to_budget(row: &libsql::Row) -> Result<AgentBudget, DatabaseError> {
    Ok(AgentBudget {
        agent_id: text(row, 0, "budget")?,
        daily_limit_cents: row.get::<i64>(1).ok(),
        weekly_limit_cents: row.get::<i64>(2).ok(),
        monthly_limit_cents: row.get::<i64>(3).ok(),
        alert_threshold: int(row, 4, "budget")?,
        paused: int(row, 5, "budget")? != 0,
        paused_at: opt_ts_col(row, 6),
        paused_reason: opt_text_col(row, 7),
        updated_at: ts_col(row, 8, "budget")?,
    })
}

/// Drain rows through a mapper, skipping rows that fail to parse.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    ctx: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match map(&row) {
                Ok(item) => out.push(item),
                Err(e) => warn!("Skipping {ctx} row: {e}"),
            },
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{ctx}: {e}"))),
        }
    }
    Ok(out)
}

async fn first_row<T>(
    mut rows: libsql::Rows,
    ctx: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => map(&row).map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{ctx}: {e}"))),
    }
}

// ── Statement helpers shared by direct writes and units of work ─────

async fn active_claim_row(conn: &Connection, file_path: &str) -> Result<Option<FileClaim>, DatabaseError> {
    let rows = conn
        .query(
            &format!(
                "SELECT {CLAIM_COLUMNS} FROM file_claims WHERE file_path = ?1 AND released_at IS NULL"
            ),
            params![file_path],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_active_claim: {e}")))?;
    first_row(rows, "get_active_claim", row_to_claim).await
}

async fn insert_event_row(conn: &Connection, event: &NewAgentEvent) -> Result<i64, DatabaseError> {
    let created_at = event.created_at.unwrap_or_else(Utc::now);
    let detail = to_json(&event.detail, "event.detail")?;
    conn.execute(
        "INSERT INTO agent_events (session_key, agent_id, event_type, detail, tokens_used, cost_usd, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            opt_text(event.session_key.clone()),
            event.agent_id.clone(),
            event.kind.as_str().to_string(),
            detail,
            opt_int(event.tokens_used),
            opt_text(event.cost_usd.map(|c| c.to_string())),
            ts(&created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("append_event", e))?;
    Ok(conn.last_insert_rowid())
}

async fn insert_step_row(conn: &Connection, step: &Step) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO steps (id, run_id, step_order, name, status, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            step.id.to_string(),
            step.run_id.to_string(),
            step.step_order,
            step.name.clone(),
            step.status.as_str(),
            opt_ts(step.started_at),
            opt_ts(step.completed_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("insert_step", e))?;
    Ok(())
}

async fn insert_assignment_row(
    conn: &Connection,
    a: &TaskAssignment,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO task_assignments (id, task_id, agent_id, repo, branch, worktree_path, description, file_manifest, status, parent_task_id, run_id, version, created_at, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            a.id.to_string(),
            a.task_id.to_string(),
            a.agent_id.clone(),
            a.repo.clone(),
            a.branch.clone(),
            a.worktree_path.to_string_lossy().to_string(),
            a.description.clone(),
            to_json(&a.file_manifest, "assignment.file_manifest")?,
            a.status.as_str(),
            opt_uuid(a.parent_task_id),
            opt_uuid(a.run_id),
            a.version,
            ts(&a.created_at),
            opt_ts(a.started_at),
            opt_ts(a.completed_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("insert_assignment", e))?;
    Ok(())
}

/// Apply one mutation. `Ok(false)` means a version check failed.
async fn apply_mutation(conn: &Connection, mutation: &Mutation) -> Result<bool, DatabaseError> {
    let affected = match mutation {
        Mutation::SaveTask(t) => conn
            .execute(
                "UPDATE tasks SET title = ?1, description = ?2, status = ?3, priority = ?4, epic = ?5, project = ?6, updated_at = ?7, version = version + 1
                 WHERE id = ?8 AND version = ?9",
                params![
                    t.title.clone(),
                    opt_text(t.description.clone()),
                    t.status.as_str(),
                    t.priority as i64,
                    opt_text(t.epic.clone()),
                    opt_text(t.project.clone()),
                    ts(&t.updated_at),
                    t.id.to_string(),
                    t.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("save_task", e))?,
        Mutation::InsertAssignment(a) => {
            insert_assignment_row(conn, a).await?;
            1
        }
        Mutation::SaveAssignment(a) => conn
            .execute(
                "UPDATE task_assignments SET status = ?1, worktree_path = ?2, description = ?3, file_manifest = ?4, run_id = ?5, started_at = ?6, completed_at = ?7, version = version + 1
                 WHERE id = ?8 AND version = ?9",
                params![
                    a.status.as_str(),
                    a.worktree_path.to_string_lossy().to_string(),
                    a.description.clone(),
                    to_json(&a.file_manifest, "assignment.file_manifest")?,
                    opt_uuid(a.run_id),
                    opt_ts(a.started_at),
                    opt_ts(a.completed_at),
                    a.id.to_string(),
                    a.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("save_assignment", e))?,
        Mutation::SaveRun(r) => conn
            .execute(
                "UPDATE runs SET status = ?1, zombie_status = ?2, ended_at = ?3, last_step_at = ?4, suspected_at = ?5, pardoned_at = ?6, version = version + 1
                 WHERE id = ?7 AND version = ?8",
                params![
                    r.status.as_str(),
                    r.zombie_status.as_str(),
                    opt_ts(r.ended_at),
                    opt_ts(r.last_step_at),
                    opt_ts(r.suspected_at),
                    opt_ts(r.pardoned_at),
                    r.id.to_string(),
                    r.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("save_run", e))?,
        Mutation::InsertStep(s) => {
            insert_step_row(conn, s).await?;
            1
        }
        Mutation::SaveStep(s) => conn
            .execute(
                "UPDATE steps SET status = ?1, started_at = ?2, completed_at = ?3 WHERE id = ?4",
                params![
                    s.status.as_str(),
                    opt_ts(s.started_at),
                    opt_ts(s.completed_at),
                    s.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("save_step", e))?,
        Mutation::ReleaseAssignmentClaims {
            assignment_id,
            released_at,
        } => {
            let released = conn
                .execute(
                    "UPDATE file_claims SET released_at = ?1 WHERE assignment_id = ?2 AND released_at IS NULL",
                    params![ts(released_at), assignment_id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::from_libsql("release_assignment_claims", e))?;
            debug!(assignment_id = %assignment_id, released, "Assignment claims released");
            // Releasing zero claims is not a conflict.
            1
        }
        Mutation::AppendEvent(e) => {
            insert_event_row(conn, e).await?;
            1
        }
    };
    Ok(affected > 0)
}

fn stale_target(mutation: &Mutation) -> (&'static str, Uuid) {
    match mutation {
        Mutation::SaveTask(t) => ("task", t.id),
        Mutation::InsertAssignment(a) | Mutation::SaveAssignment(a) => ("assignment", a.id),
        Mutation::SaveRun(r) => ("run", r.id),
        Mutation::InsertStep(s) | Mutation::SaveStep(s) => ("step", s.id),
        Mutation::ReleaseAssignmentClaims { assignment_id, .. } => ("assignment", *assignment_id),
        Mutation::AppendEvent(_) => ("event", Uuid::nil()),
    }
}

async fn apply_all(conn: &Connection, mutations: &[Mutation]) -> Result<CommitOutcome, DatabaseError> {
    for mutation in mutations {
        if !apply_mutation(conn, mutation).await? {
            let (entity, id) = stale_target(mutation);
            return Ok(CommitOutcome::Stale { entity, id });
        }
    }
    Ok(CommitOutcome::Committed)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        migrations::run_migrations(self.conn()).await
    }

    async fn commit(&self, mutations: &[Mutation]) -> Result<CommitOutcome, DatabaseError> {
        let _guard = self.exclusive().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit begin: {e}")))?;

        match apply_all(&tx, mutations).await {
            Ok(CommitOutcome::Committed) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
                Ok(CommitOutcome::Committed)
            }
            Ok(stale) => {
                tx.rollback()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("rollback: {e}")))?;
                debug!(outcome = ?stale, "Unit of work rolled back");
                Ok(stale)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback after failed unit of work also failed");
                }
                Err(e)
            }
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        self.conn()
            .execute(
                &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    task.id.to_string(),
                    task.title.clone(),
                    opt_text(task.description.clone()),
                    task.status.as_str(),
                    task.priority as i64,
                    opt_text(task.epic.clone()),
                    opt_text(task.project.clone()),
                    task.version,
                    ts(&task.created_at),
                    ts(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_task", e))?;
        debug!(task_id = %task.id, status = %task.status, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;
        first_row(rows, "get_task", row_to_task).await
    }

    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                     ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?;
        collect_rows(rows, "task", row_to_task).await
    }

    // ── Workflows ───────────────────────────────────────────────────

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        self.conn()
            .execute(
                &format!("INSERT INTO workflows ({WORKFLOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    workflow.id.to_string(),
                    workflow.name.clone(),
                    opt_text(workflow.description.clone()),
                    to_json(&workflow.steps, "workflow.steps")?,
                    workflow.version,
                    ts(&workflow.created_at),
                    ts(&workflow.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_workflow", e))?;
        Ok(())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<CommitOutcome, DatabaseError> {
        let _guard = self.exclusive().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE workflows SET steps = ?1, description = ?2, updated_at = ?3, version = version + 1
                 WHERE id = ?4 AND version = ?5",
                params![
                    to_json(&workflow.steps, "workflow.steps")?,
                    opt_text(workflow.description.clone()),
                    ts(&workflow.updated_at),
                    workflow.id.to_string(),
                    workflow.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("save_workflow", e))?;
        if affected == 0 {
            return Ok(CommitOutcome::Stale {
                entity: "workflow",
                id: workflow.id,
            });
        }
        Ok(CommitOutcome::Committed)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workflow: {e}")))?;
        first_row(rows, "get_workflow", row_to_workflow).await
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workflow_by_name: {e}")))?;
        first_row(rows, "get_workflow_by_name", row_to_workflow).await
    }

    async fn workflow_in_use(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.exclusive().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT EXISTS(SELECT 1 FROM runs WHERE workflow_id = ?1)",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("workflow_in_use: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) != 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("workflow_in_use: {e}"))),
        }
    }

    // ── Runs & steps ────────────────────────────────────────────────

    async fn insert_run(
        &self,
        run: &Run,
        steps: &[Step],
        event: &NewAgentEvent,
    ) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_run begin: {e}")))?;

        let result = async {
            tx.execute(
                &format!(
                    "INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    run.id.to_string(),
                    run.session_key.clone(),
                    run.agent_id.clone(),
                    opt_uuid(run.task_id),
                    opt_uuid(run.workflow_id),
                    run.status.as_str(),
                    run.zombie_status.as_str(),
                    ts(&run.started_at),
                    opt_ts(run.ended_at),
                    opt_ts(run.last_step_at),
                    opt_ts(run.suspected_at),
                    opt_ts(run.pardoned_at),
                    run.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_run", e))?;
            for step in steps {
                insert_step_row(&tx, step).await?;
            }
            insert_event_row(&tx, event).await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("insert_run commit: {e}")))?;
                debug!(run_id = %run.id, session_key = %run.session_key, steps = steps.len(), "Run inserted");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "insert_run rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_run: {e}")))?;
        first_row(rows, "get_run", row_to_run).await
    }

    async fn get_active_run_by_session(
        &self,
        session_key: &str,
    ) -> Result<Option<Run>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE session_key = ?1 AND status = 'running'"
                ),
                params![session_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_run_by_session: {e}")))?;
        first_row(rows, "get_active_run_by_session", row_to_run).await
    }

    async fn get_latest_run_by_session(
        &self,
        session_key: &str,
    ) -> Result<Option<Run>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE session_key = ?1
                     ORDER BY started_at DESC, rowid DESC LIMIT 1"
                ),
                params![session_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_latest_run_by_session: {e}")))?;
        first_row(rows, "get_latest_run_by_session", row_to_run).await
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE status = ?1 ORDER BY started_at ASC"),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_runs_by_status: {e}")))?;
        collect_rows(rows, "run", row_to_run).await
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_order ASC"),
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_steps: {e}")))?;
        collect_rows(rows, "step", row_to_step).await
    }

    // ── Assignments ─────────────────────────────────────────────────

    async fn get_assignment(&self, id: Uuid) -> Result<Option<TaskAssignment>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ASSIGNMENT_COLUMNS} FROM task_assignments WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_assignment: {e}")))?;
        first_row(rows, "get_assignment", row_to_assignment).await
    }

    async fn get_live_assignment_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Option<TaskAssignment>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM task_assignments
                     WHERE task_id = ?1 AND status IN {LIVE_ASSIGNMENT_STATUSES}"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_live_assignment_for_task: {e}")))?;
        first_row(rows, "get_live_assignment_for_task", row_to_assignment).await
    }

    async fn get_live_assignment_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Option<TaskAssignment>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM task_assignments
                     WHERE run_id = ?1 AND status IN {LIVE_ASSIGNMENT_STATUSES}"
                ),
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_live_assignment_for_run: {e}")))?;
        first_row(rows, "get_live_assignment_for_run", row_to_assignment).await
    }

    async fn list_live_assignments(&self) -> Result<Vec<TaskAssignment>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM task_assignments
                     WHERE status IN {LIVE_ASSIGNMENT_STATUSES} ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_live_assignments: {e}")))?;
        collect_rows(rows, "assignment", row_to_assignment).await
    }

    // ── File claims ─────────────────────────────────────────────────

    async fn try_claim(&self, claim: &FileClaim) -> Result<ClaimAttempt, DatabaseError> {
        let _guard = self.exclusive().await;

        if let Some(existing) = active_claim_row(self.conn(), &claim.file_path).await? {
            return Ok(if existing.same_owner(claim) {
                ClaimAttempt::AlreadyHeld(existing)
            } else {
                ClaimAttempt::Conflict(existing)
            });
        }

        let inserted = self
            .conn()
            .execute(
                &format!("INSERT INTO file_claims ({CLAIM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)"),
                params![
                    claim.id.to_string(),
                    claim.agent_id.clone(),
                    claim.file_path.clone(),
                    opt_uuid(claim.assignment_id),
                    opt_text(claim.description.clone()),
                    ts(&claim.claimed_at),
                ],
            )
            .await;

        match inserted {
            Ok(_) => Ok(ClaimAttempt::Acquired(FileClaim {
                released_at: None,
                ..claim.clone()
            })),
            Err(e) => {
                let err = DatabaseError::from_libsql("try_claim", e);
                // Another process sharing the file won the race.
                if err.is_constraint() {
                    if let Some(holder) = active_claim_row(self.conn(), &claim.file_path).await? {
                        return Ok(ClaimAttempt::Conflict(holder));
                    }
                }
                Err(err)
            }
        }
    }

    async fn release_claim(
        &self,
        agent_id: &str,
        file_path: &str,
        released_at: DateTime<Utc>,
    ) -> Result<Option<FileClaim>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CLAIM_COLUMNS} FROM file_claims
                     WHERE file_path = ?1 AND agent_id = ?2 AND released_at IS NULL"
                ),
                params![file_path, agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;
        let Some(claim) = first_row(rows, "release_claim", row_to_claim).await? else {
            return Ok(None);
        };

        self.conn()
            .execute(
                "UPDATE file_claims SET released_at = ?1 WHERE id = ?2 AND released_at IS NULL",
                params![ts(&released_at), claim.id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("release_claim", e))?;

        Ok(Some(FileClaim {
            released_at: Some(released_at),
            ..claim
        }))
    }

    async fn release_claim_by_id(
        &self,
        id: Uuid,
        released_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.exclusive().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE file_claims SET released_at = ?1 WHERE id = ?2 AND released_at IS NULL",
                params![ts(&released_at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("release_claim_by_id", e))?;
        Ok(affected > 0)
    }

    async fn get_active_claim(&self, file_path: &str) -> Result<Option<FileClaim>, DatabaseError> {
        let _guard = self.exclusive().await;
        active_claim_row(self.conn(), file_path).await
    }

    async fn list_active_claims(&self) -> Result<Vec<FileClaim>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CLAIM_COLUMNS} FROM file_claims WHERE released_at IS NULL
                     ORDER BY claimed_at ASC, file_path ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_claims: {e}")))?;
        collect_rows(rows, "claim", row_to_claim).await
    }

    async fn list_active_claims_for_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Vec<FileClaim>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CLAIM_COLUMNS} FROM file_claims
                     WHERE assignment_id = ?1 AND released_at IS NULL ORDER BY file_path ASC"
                ),
                params![assignment_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_claims_for_assignment: {e}")))?;
        collect_rows(rows, "claim", row_to_claim).await
    }

    async fn list_orphaned_claims(&self) -> Result<Vec<FileClaim>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT c.id, c.agent_id, c.file_path, c.assignment_id, c.description, c.claimed_at, c.released_at
                     FROM file_claims c
                     JOIN task_assignments a ON a.id = c.assignment_id
                     WHERE c.released_at IS NULL AND a.status IN {TERMINAL_ASSIGNMENT_STATUSES}"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_orphaned_claims: {e}")))?;
        collect_rows(rows, "claim", row_to_claim).await
    }

    // ── Agent events ────────────────────────────────────────────────

    async fn append_event(&self, event: &NewAgentEvent) -> Result<i64, DatabaseError> {
        let _guard = self.exclusive().await;
        insert_event_row(self.conn(), event).await
    }

    async fn last_event_at(
        &self,
        session_key: &str,
        exclude: &[EventKind],
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let _guard = self.exclusive().await;
        let mut sql =
            String::from("SELECT MAX(created_at) FROM agent_events WHERE session_key = ?1");
        let mut values = vec![libsql::Value::Text(session_key.to_string())];
        if !exclude.is_empty() {
            let placeholders: Vec<String> =
                (0..exclude.len()).map(|i| format!("?{}", i + 2)).collect();
            sql.push_str(&format!(" AND event_type NOT IN ({})", placeholders.join(", ")));
            values.extend(
                exclude
                    .iter()
                    .map(|k| libsql::Value::Text(k.as_str().to_string())),
            );
        }

        let mut rows = self
            .conn()
            .query(&sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("last_event_at: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(opt_ts_col(&row, 0)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("last_event_at: {e}"))),
        }
    }

    async fn recent_events(
        &self,
        session_key: &str,
        kind: Option<&EventKind>,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = match kind {
            Some(kind) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {EVENT_COLUMNS} FROM agent_events
                             WHERE session_key = ?1 AND event_type = ?2
                             ORDER BY created_at DESC, id DESC LIMIT ?3"
                        ),
                        params![session_key, kind.as_str().to_string(), limit as i64],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {EVENT_COLUMNS} FROM agent_events WHERE session_key = ?1
                             ORDER BY created_at DESC, id DESC LIMIT ?2"
                        ),
                        params![session_key, limit as i64],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("recent_events: {e}")))?;
        collect_rows(rows, "event", row_to_event).await
    }

    // ── Ledger ──────────────────────────────────────────────────────

    async fn insert_rate_limit(&self, window: &RateLimitWindow) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        self.conn()
            .execute(
                &format!("INSERT INTO rate_limit_windows ({RATE_LIMIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    window.provider.clone(),
                    window.metric_type.as_str(),
                    window.limit,
                    window.remaining,
                    opt_ts(window.reset_at),
                    ts(&window.recorded_at),
                    window.used,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_rate_limit", e))?;
        Ok(())
    }

    async fn latest_rate_limits(
        &self,
        provider: &str,
    ) -> Result<Vec<RateLimitWindow>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RATE_LIMIT_COLUMNS} FROM rate_limit_windows r
                     WHERE r.provider = ?1 AND r.id = (
                         SELECT MAX(r2.id) FROM rate_limit_windows r2
                         WHERE r2.provider = r.provider AND r2.metric_type = r.metric_type
                     )
                     ORDER BY r.metric_type ASC"
                ),
                params![provider],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_rate_limits: {e}")))?;
        collect_rows(rows, "rate_limit", row_to_rate_limit).await
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        self.conn()
            .execute(
                "INSERT INTO usage_records (session_key, provider, model, input_tokens, output_tokens, cost_usd, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.session_key.clone(),
                    record.provider.clone(),
                    record.model.clone(),
                    record.input_tokens,
                    record.output_tokens,
                    record.cost_usd.to_string(),
                    ts(&record.recorded_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_usage", e))?;
        Ok(())
    }

    async fn usage_summary(
        &self,
        session_key: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, DatabaseError> {
        let _guard = self.exclusive().await;
        // Empty string sorts before every timestamp.
        let since = since.map(|t| ts(&t)).unwrap_or_default();
        let mut summary = UsageSummary::default();

        let mut rows = self
            .conn()
            .query(
                "SELECT input_tokens, output_tokens, cost_usd FROM usage_records
                 WHERE session_key = ?1 AND recorded_at >= ?2",
                params![session_key, since.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("usage_summary: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            summary.input_tokens += row.get::<i64>(0).unwrap_or(0).max(0) as u64;
            summary.output_tokens += row.get::<i64>(1).unwrap_or(0).max(0) as u64;
            summary.cost_usd += opt_text_col(&row, 2).map(|s| decimal(&s)).unwrap_or_default();
            summary.calls += 1;
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT tokens_used, cost_usd FROM agent_events
                 WHERE session_key = ?1 AND created_at >= ?2
                   AND (tokens_used IS NOT NULL OR cost_usd IS NOT NULL)",
                params![session_key, since],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("usage_summary events: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            summary.event_tokens += row.get::<i64>(0).unwrap_or(0).max(0) as u64;
            summary.cost_usd += opt_text_col(&row, 1).map(|s| decimal(&s)).unwrap_or_default();
            summary.calls += 1;
        }

        Ok(summary)
    }

    async fn agent_spend_since(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError> {
        let _guard = self.exclusive().await;
        let since = ts(&since);
        let mut total = Decimal::ZERO;

        let mut rows = self
            .conn()
            .query(
                "SELECT cost_usd FROM usage_records
                 WHERE recorded_at >= ?2
                   AND session_key IN (SELECT session_key FROM runs WHERE agent_id = ?1)",
                params![agent_id, since.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("agent_spend_since: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            total += opt_text_col(&row, 0).map(|s| decimal(&s)).unwrap_or_default();
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT cost_usd FROM agent_events
                 WHERE agent_id = ?1 AND created_at >= ?2 AND cost_usd IS NOT NULL",
                params![agent_id, since],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("agent_spend_since events: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            total += opt_text_col(&row, 0).map(|s| decimal(&s)).unwrap_or_default();
        }

        Ok(total)
    }

    // ── Budgets ─────────────────────────────────────────────────────

    async fn upsert_budget(&self, budget: &AgentBudget) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO agent_budgets ({BUDGET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(agent_id) DO UPDATE SET
                        daily_limit_cents = excluded.daily_limit_cents,
                        weekly_limit_cents = excluded.weekly_limit_cents,
                        monthly_limit_cents = excluded.monthly_limit_cents,
                        alert_threshold = excluded.alert_threshold,
                        paused = excluded.paused,
                        paused_at = excluded.paused_at,
                        paused_reason = excluded.paused_reason,
                        updated_at = excluded.updated_at"
                ),
                params![
                    budget.agent_id.clone(),
                    opt_int(budget.daily_limit_cents),
                    opt_int(budget.weekly_limit_cents),
                    opt_int(budget.monthly_limit_cents),
                    budget.alert_threshold,
                    budget.paused as i64,
                    opt_ts(budget.paused_at),
                    opt_text(budget.paused_reason.clone()),
                    ts(&budget.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_budget", e))?;
        debug!(agent_id = %budget.agent_id, paused = budget.paused, "Budget saved");
        Ok(())
    }

    async fn get_budget(&self, agent_id: &str) -> Result<Option<AgentBudget>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {BUDGET_COLUMNS} FROM agent_budgets WHERE agent_id = ?1"),
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_budget: {e}")))?;
        first_row(rows, "get_budget", row_to_budget).await
    }

    async fn list_budgets(&self) -> Result<Vec<AgentBudget>, DatabaseError> {
        let _guard = self.exclusive().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {BUDGET_COLUMNS} FROM agent_budgets ORDER BY agent_id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_budgets: {e}")))?;
        collect_rows(rows, "budget", row_to_budget).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn sample_run(session_key: &str) -> Run {
        Run {
            id: Uuid::new_v4(),
            session_key: session_key.into(),
            agent_id: "coder".into(),
            task_id: None,
            workflow_id: None,
            status: RunStatus::Running,
            zombie_status: ZombieStatus::None,
            started_at: Utc::now(),
            ended_at: None,
            last_step_at: None,
            suspected_at: None,
            pardoned_at: None,
            version: 0,
        }
    }

    fn started(run: &Run) -> NewAgentEvent {
        NewAgentEvent::new(run.agent_id.clone(), EventKind::RunStarted).for_session(run.session_key.clone())
    }

    #[tokio::test]
    async fn task_round_trip() {
        let db = test_db().await;
        let task = Task::new("Write docs").with_priority(2).with_epic("docs");
        db.insert_task(&task).await.unwrap();

        let loaded = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Write docs");
        assert_eq!(loaded.priority, 2);
        assert_eq!(loaded.epic.as_deref(), Some("docs"));
        assert_eq!(loaded.status, TaskStatus::Backlog);
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_version_rolls_back_whole_unit() {
        let db = test_db().await;
        let task = Task::new("t");
        db.insert_task(&task).await.unwrap();

        let first = task.moved_to(TaskStatus::Queued);
        let outcome = db.commit(&[Mutation::SaveTask(first)]).await.unwrap();
        assert!(outcome.is_committed());

        // Second writer still holds version 0.
        let event = NewAgentEvent::new("op", EventKind::Other("custom".into())).for_session("s");
        let stale = task.moved_to(TaskStatus::Planned);
        let outcome = db
            .commit(&[Mutation::AppendEvent(event), Mutation::SaveTask(stale)])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Stale {
                entity: "task",
                id: task.id
            }
        );

        let loaded = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.version, 1);
        // The event in the rolled-back unit is gone too.
        assert!(db.recent_events("s", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_running_run_for_session_is_constraint() {
        let db = test_db().await;
        let run = sample_run("sess-1");
        db.insert_run(&run, &[], &started(&run)).await.unwrap();

        let dup = sample_run("sess-1");
        let err = db.insert_run(&dup, &[], &started(&dup)).await.unwrap_err();
        assert!(err.is_constraint());

        // Nothing from the failed insert leaked.
        assert!(db.get_run(dup.id).await.unwrap().is_none());
        assert_eq!(db.recent_events("sess-1", None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_steps_are_ordered() {
        let db = test_db().await;
        let run = sample_run("s");
        let steps: Vec<Step> = [3, 1, 2]
            .into_iter()
            .map(|i| Step::pending(run.id, i, format!("step-{i}")))
            .collect();
        db.insert_run(&run, &steps, &started(&run)).await.unwrap();

        let loaded = db.list_steps(run.id).await.unwrap();
        let orders: Vec<i64> = loaded.iter().map(|s| s.step_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn claim_is_exclusive_per_path() {
        let db = test_db().await;
        let a = FileClaim::new("agent-a", "x.py");
        let b = FileClaim::new("agent-b", "x.py");

        assert!(matches!(db.try_claim(&a).await.unwrap(), ClaimAttempt::Acquired(_)));
        match db.try_claim(&b).await.unwrap() {
            ClaimAttempt::Conflict(holder) => assert_eq!(holder.agent_id, "agent-a"),
            other => panic!("expected conflict, got {other:?}"),
        }

        let again = FileClaim::new("agent-a", "x.py");
        match db.try_claim(&again).await.unwrap() {
            ClaimAttempt::AlreadyHeld(existing) => assert_eq!(existing.id, a.id),
            other => panic!("expected already held, got {other:?}"),
        }

        let released = db.release_claim("agent-a", "x.py", Utc::now()).await.unwrap();
        assert!(released.unwrap().released_at.is_some());
        assert!(matches!(db.try_claim(&b).await.unwrap(), ClaimAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn last_event_ignores_excluded_kinds() {
        let db = test_db().await;
        let base = Utc::now() - Duration::minutes(30);
        db.append_event(
            &NewAgentEvent::new("a", EventKind::ToolCall)
                .for_session("s")
                .at(base),
        )
        .await
        .unwrap();
        db.append_event(
            &NewAgentEvent::new("a", EventKind::Heartbeat)
                .for_session("s")
                .at(base + Duration::minutes(20)),
        )
        .await
        .unwrap();

        let all = db.last_event_at("s", &[]).await.unwrap().unwrap();
        let real = db
            .last_event_at("s", &[EventKind::Heartbeat])
            .await
            .unwrap()
            .unwrap();
        assert!(all > real);
        assert!((real - base).num_seconds().abs() < 1);
        assert!(db.last_event_at("other", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_summary_sums_records_and_event_tokens() {
        let db = test_db().await;
        let now = Utc::now();
        for (tokens, cost) in [(1000, "0.25"), (500, "0.10")] {
            db.insert_usage(&UsageRecord {
                session_key: "s".into(),
                provider: "anthropic".into(),
                model: "m".into(),
                input_tokens: tokens,
                output_tokens: tokens / 2,
                cost_usd: cost.parse().unwrap(),
                recorded_at: now,
            })
            .await
            .unwrap();
        }
        db.append_event(
            &NewAgentEvent::new("a", EventKind::Output)
                .for_session("s")
                .with_tokens(200)
                .at(now),
        )
        .await
        .unwrap();

        let summary = db.usage_summary("s", None).await.unwrap();
        assert_eq!(summary.input_tokens, 1500);
        assert_eq!(summary.output_tokens, 750);
        assert_eq!(summary.event_tokens, 200);
        assert_eq!(summary.cost_usd, "0.35".parse::<Decimal>().unwrap());
        assert_eq!(summary.calls, 3);

        let later = db
            .usage_summary("s", Some(now + Duration::minutes(1)))
            .await
            .unwrap();
        assert_eq!(later.total_tokens(), 0);
    }

    #[tokio::test]
    async fn budget_upsert_round_trip() {
        let db = test_db().await;
        assert!(db.get_budget("kevin").await.unwrap().is_none());

        let budget = AgentBudget {
            daily_limit_cents: Some(500),
            ..AgentBudget::new("kevin")
        };
        db.upsert_budget(&budget).await.unwrap();
        let paused = budget.paused_because("manual", Utc::now());
        db.upsert_budget(&paused).await.unwrap();

        let loaded = db.get_budget("kevin").await.unwrap().unwrap();
        assert_eq!(loaded.daily_limit_cents, Some(500));
        assert_eq!(loaded.weekly_limit_cents, None);
        assert_eq!(loaded.alert_threshold, 80);
        assert!(loaded.paused);
        assert_eq!(loaded.paused_reason.as_deref(), Some("manual"));
        assert_eq!(db.list_budgets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn agent_spend_follows_the_agents_sessions() {
        let db = test_db().await;
        let run = sample_run("sess-k");
        db.insert_run(&run, &[], &started(&run)).await.unwrap();
        let now = Utc::now();
        for (session, cost, at) in [
            ("sess-k", "0.25", now - Duration::minutes(5)),
            ("sess-k", "1.00", now - Duration::days(40)),
            ("sess-other", "9.00", now),
        ] {
            db.insert_usage(&UsageRecord {
                session_key: session.into(),
                provider: "anthropic".into(),
                model: "sonnet".into(),
                input_tokens: 10,
                output_tokens: 10,
                cost_usd: Decimal::from_str(cost).unwrap(),
                recorded_at: at,
            })
            .await
            .unwrap();
        }
        db.append_event(
            &NewAgentEvent::new("coder", EventKind::ToolCall)
                .with_cost(Decimal::from_str("0.05").unwrap())
                .at(now),
        )
        .await
        .unwrap();

        let spend = db.agent_spend_since("coder", now - Duration::days(1)).await.unwrap();
        assert_eq!(spend, Decimal::from_str("0.30").unwrap());
        assert_eq!(
            db.agent_spend_since("nobody", now - Duration::days(1)).await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reads_interleave_safely_with_claim_writes() {
        let db = std::sync::Arc::new(test_db().await);

        let writers = (0..8).map(|i| {
            let db = std::sync::Arc::clone(&db);
            tokio::spawn(async move {
                db.try_claim(&FileClaim::new(format!("agent-{i}"), format!("src/f{i}.rs")))
                    .await
            })
        });
        let readers = (0..8).map(|_| {
            let db = std::sync::Arc::clone(&db);
            tokio::spawn(async move { db.list_active_claims().await.map(|claims| claims.len()) })
        });
        let writers: Vec<_> = writers.collect();
        let readers: Vec<_> = readers.collect();

        for writer in writers {
            assert!(matches!(writer.await.unwrap().unwrap(), ClaimAttempt::Acquired(_)));
        }
        for reader in readers {
            assert!(reader.await.unwrap().unwrap() <= 8);
        }
        assert_eq!(db.list_active_claims().await.unwrap().len(), 8);
    }
}
