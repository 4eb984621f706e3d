//! Version-tracked database migrations for the libSQL backend.
//!
//! One migration per logical namespace (work tracking, concurrency,
//! telemetry), then additive changes. `run_migrations()` checks the current
//! version and applies only the new ones sequentially.
//!
//! The invariants that must hold under concurrent writers are enforced by
//! partial unique indexes, not only by application checks:
//! one active claim per path, one live assignment per task, one running run
//! per session key, one step per `(run_id, step_order)`.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "work_tracking",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'backlog',
                priority INTEGER NOT NULL DEFAULT 5,
                epic TEXT,
                project TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_rank ON tasks(status, priority, created_at, id);

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                steps TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                session_key TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                task_id TEXT REFERENCES tasks(id),
                workflow_id TEXT REFERENCES workflows(id),
                status TEXT NOT NULL DEFAULT 'running',
                zombie_status TEXT NOT NULL DEFAULT 'none',
                started_at TEXT NOT NULL,
                ended_at TEXT,
                last_step_at TEXT,
                suspected_at TEXT,
                pardoned_at TEXT,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_active_session
                ON runs(session_key) WHERE status = 'running';
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_key, started_at);
            CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow_id);

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                step_order INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT,
                completed_at TEXT,
                UNIQUE(run_id, step_order)
            );

            CREATE TABLE IF NOT EXISTS task_assignments (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                agent_id TEXT NOT NULL,
                repo TEXT NOT NULL,
                branch TEXT NOT NULL,
                worktree_path TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                file_manifest TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'assigned',
                parent_task_id TEXT,
                run_id TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_live_task
                ON task_assignments(task_id)
                WHERE status IN ('assigned', 'in_progress', 'review', 'merging');
            CREATE INDEX IF NOT EXISTS idx_assignments_status ON task_assignments(status);
            CREATE INDEX IF NOT EXISTS idx_assignments_run ON task_assignments(run_id);
        "#,
    },
    Migration {
        version: 2,
        name: "concurrency",
        sql: r#"
            CREATE TABLE IF NOT EXISTS file_claims (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                assignment_id TEXT,
                description TEXT,
                claimed_at TEXT NOT NULL,
                released_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_file_claims_active_path
                ON file_claims(file_path) WHERE released_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_file_claims_assignment ON file_claims(assignment_id);
            CREATE INDEX IF NOT EXISTS idx_file_claims_agent ON file_claims(agent_id);
        "#,
    },
    Migration {
        version: 3,
        name: "telemetry",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agent_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key TEXT,
                agent_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT '{}',
                tokens_used INTEGER,
                cost_usd TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_events_session
                ON agent_events(session_key, created_at);
            CREATE INDEX IF NOT EXISTS idx_agent_events_session_type
                ON agent_events(session_key, event_type, id);

            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd TEXT NOT NULL DEFAULT '0',
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_session ON usage_records(session_key, recorded_at);

            CREATE TABLE IF NOT EXISTS rate_limit_windows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                limit_value INTEGER NOT NULL,
                remaining INTEGER NOT NULL,
                reset_at TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limits_provider
                ON rate_limit_windows(provider, metric_type, id);
        "#,
    },
    Migration {
        version: 4,
        name: "budgets",
        sql: r#"
            ALTER TABLE workflows ADD COLUMN description TEXT;
            ALTER TABLE rate_limit_windows ADD COLUMN used INTEGER;

            CREATE TABLE IF NOT EXISTS agent_budgets (
                agent_id TEXT PRIMARY KEY,
                daily_limit_cents INTEGER,
                weekly_limit_cents INTEGER,
                monthly_limit_cents INTEGER,
                alert_threshold INTEGER NOT NULL DEFAULT 80,
                paused INTEGER NOT NULL DEFAULT 0,
                paused_at TEXT,
                paused_reason TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_events_agent
                ON agent_events(agent_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_runs_agent ON runs(agent_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
