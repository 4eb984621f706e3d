//! Operator and agent-runtime HTTP surface.
//!
//! Every response is JSON with at least `success` and `message`. When an
//! operator token is configured, mutating routes require
//! `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assignments::{AssignRequest, AssignmentOutcome, AssignmentStatus, Allocator};
use crate::backlog::{Backlog, Task, TaskStatus};
use crate::config::ForemanConfig;
use crate::error::{
    AssignmentError, BacklogError, ClaimError, DatabaseError, Error, ErrorKind, EventError,
    LedgerError, RunError,
};
use crate::events::{EventLog, NewAgentEvent};
use crate::ledger::{BudgetLimits, Ledger, RateObservation, UsageRecord};
use crate::runs::{RunOutcome, StartRun, StepOutcome};
use crate::store::Database;
use crate::zombie::{ControlOutcome, ZombieControl};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub backlog: Backlog,
    pub allocator: Allocator,
    pub control: ZombieControl,
    pub events: EventLog,
    pub ledger: Ledger,
    pub operator_token: Option<SecretString>,
}

impl AppState {
    pub fn new(db: Arc<dyn Database>, config: &ForemanConfig) -> Self {
        Self {
            backlog: Backlog::new(Arc::clone(&db)),
            allocator: Allocator::new(Arc::clone(&db), config.worktree_root.clone()),
            control: ZombieControl::new(Arc::clone(&db)),
            events: EventLog::new(Arc::clone(&db)).with_skew_tolerance(config.clock_skew_tolerance),
            ledger: Ledger::new(db),
            operator_token: config.operator_token.clone(),
        }
    }

    /// Builder: use a control surface with a session terminator attached.
    pub fn with_control(mut self, control: ZombieControl) -> Self {
        self.control = control;
        self
    }
}

/// Build the router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/zombies", get(list_zombies))
        .route("/api/claims", get(list_claims))
        .route("/api/tasks", post(ingest_task))
        .route("/api/workflows", post(register_workflow))
        .route("/api/runs", post(start_run))
        .route("/api/runs/{run_id}/steps/{order}/start", post(start_step))
        .route("/api/runs/{run_id}/steps/{order}/advance", post(advance_step))
        .route("/api/runs/{run_id}/end", post(end_run))
        .route("/api/assignments", get(list_assignments).post(assign))
        .route("/api/assignments/{id}/begin", post(begin_work))
        .route("/api/assignments/{id}/files", post(declare_files))
        .route("/api/assignments/{id}/transition", post(transition_assignment))
        .route("/api/assignments/{id}/complete", post(complete_assignment))
        .route("/api/sessions/{session}/kill", post(kill_session))
        .route("/api/sessions/{session}/pardon", post(pardon_session))
        .route("/api/events", post(push_event))
        .route("/api/ledger/rate-limits", post(record_rate_limit))
        .route("/api/ledger/usage", post(record_usage))
        .route("/api/budgets", get(list_budgets))
        .route("/api/budgets/{agent}", put(set_budget))
        .route("/api/budgets/{agent}/check", post(check_budget))
        .route("/api/budgets/{agent}/pause", post(pause_agent))
        .route("/api/budgets/{agent}/resume", post(resume_agent))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────

/// Error wrapper rendering `{success: false, kind, message}`.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

macro_rules! api_error_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ApiError {
            fn from(err: $ty) -> Self {
                Self(err.into())
            }
        })*
    };
}

api_error_from!(
    DatabaseError,
    BacklogError,
    ClaimError,
    AssignmentError,
    RunError,
    EventError,
    LedgerError
);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidTransition | ErrorKind::OutOfOrder => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if kind == ErrorKind::Internal {
            warn!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(json!({
                "success": false,
                "kind": kind,
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn authorize(state: &AppState, headers: &HeaderMap, action: &str) -> Result<(), ApiError> {
    let Some(expected) = &state.operator_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let matches = provided.is_some_and(|token| {
        bool::from(token.as_bytes().ct_eq(expected.expose_secret().as_bytes()))
    });
    if matches {
        return Ok(());
    }
    warn!(action, "Rejected unauthorized request");
    Err(Error::Unauthorized {
        action: action.to_string(),
    }
    .into())
}

fn outcome_response(outcome: ControlOutcome) -> Response {
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(outcome)).into_response()
}

// ── Read routes ─────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "success": true,
        "message": "ok",
        "service": "foreman",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_zombies(State(state): State<AppState>) -> ApiResult {
    let zombies = state.control.list_zombies().await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("{} suspected session(s)", zombies.len()),
        "zombies": zombies,
    }))
    .into_response())
}

async fn list_assignments(State(state): State<AppState>) -> ApiResult {
    let assignments = state.allocator.list_live().await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("{} live assignment(s)", assignments.len()),
        "assignments": assignments,
    }))
    .into_response())
}

async fn list_claims(State(state): State<AppState>) -> ApiResult {
    let claims = state.allocator.claims().list_active().await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("{} active claim(s)", claims.len()),
        "claims": claims,
    }))
    .into_response())
}

/// Success body carrying one named payload.
fn payload(message: &str, key: &str, value: impl Serialize) -> Json<serde_json::Value> {
    let mut body = json!({ "success": true, "message": message });
    body[key] = json!(value);
    Json(body)
}

fn ok(message: &str, key: &str, value: impl Serialize) -> Response {
    payload(message, key, value).into_response()
}

fn created(message: &str, key: &str, value: impl Serialize) -> Response {
    (StatusCode::CREATED, payload(message, key, value)).into_response()
}

// ── Backlog & workflows ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IngestTaskRequest {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    epic: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    status: Option<TaskStatus>,
}

async fn ingest_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestTaskRequest>,
) -> ApiResult {
    authorize(&state, &headers, "ingest task")?;
    let mut task = Task::new(body.title);
    task.description = body.description;
    task.epic = body.epic;
    task.project = body.project;
    if let Some(priority) = body.priority {
        task.priority = priority;
    }
    if let Some(status) = body.status {
        task.status = status;
    }
    let task = state.backlog.ingest(task).await?;
    Ok(created("task ingested", "task", task))
}

#[derive(Debug, Deserialize)]
struct WorkflowRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    steps: Vec<String>,
}

async fn register_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WorkflowRequest>,
) -> ApiResult {
    authorize(&state, &headers, "register workflow")?;
    let workflow = state
        .allocator
        .runs()
        .register_workflow(&body.name, body.description.as_deref(), body.steps)
        .await?;
    Ok(ok("workflow registered", "workflow", workflow))
}

// ── Runs & steps ────────────────────────────────────────────────────

async fn start_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartRun>,
) -> ApiResult {
    authorize(&state, &headers, "start run")?;
    let run = state.allocator.runs().start_run(request).await?;
    Ok(created("run started", "run", run))
}

async fn start_step(
    State(state): State<AppState>,
    Path((run_id, order)): Path<(Uuid, i64)>,
    headers: HeaderMap,
) -> ApiResult {
    authorize(&state, &headers, "start step")?;
    let step = state.allocator.runs().start_step(run_id, order).await?;
    Ok(ok("step started", "step", step))
}

#[derive(Debug, Deserialize)]
struct AdvanceRequest {
    outcome: StepOutcome,
}

async fn advance_step(
    State(state): State<AppState>,
    Path((run_id, order)): Path<(Uuid, i64)>,
    headers: HeaderMap,
    Json(body): Json<AdvanceRequest>,
) -> ApiResult {
    authorize(&state, &headers, "advance step")?;
    let advanced = state
        .allocator
        .runs()
        .advance_step(run_id, order, body.outcome)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "step advanced",
        "step": advanced.step,
        "run_status": advanced.run_status,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct EndRunRequest {
    outcome: RunOutcome,
}

async fn end_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<EndRunRequest>,
) -> ApiResult {
    authorize(&state, &headers, "end run")?;
    let run = state.allocator.runs().end_run(run_id, body.outcome).await?;
    Ok(ok("run ended", "run", run))
}

// ── Assignments ─────────────────────────────────────────────────────

async fn assign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AssignRequest>,
) -> ApiResult {
    authorize(&state, &headers, "assign")?;
    let assignment = state.allocator.assign(request).await?;
    Ok(created("task assigned", "assignment", assignment))
}

#[derive(Debug, Deserialize)]
struct BeginWorkRequest {
    session_key: String,
    #[serde(default)]
    workflow_id: Option<Uuid>,
}

async fn begin_work(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<BeginWorkRequest>,
) -> ApiResult {
    authorize(&state, &headers, "begin work")?;
    let (assignment, run) = state
        .allocator
        .begin_work(id, &body.session_key, body.workflow_id)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "work started",
        "assignment": assignment,
        "run": run,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct DeclareFilesRequest {
    files: Vec<String>,
}

async fn declare_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<DeclareFilesRequest>,
) -> ApiResult {
    authorize(&state, &headers, "declare files")?;
    let assignment = state.allocator.declare_files(id, &body.files).await?;
    Ok(ok("files claimed", "assignment", assignment))
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    status: AssignmentStatus,
}

async fn transition_assignment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<TransitionRequest>,
) -> ApiResult {
    authorize(&state, &headers, "transition assignment")?;
    let assignment = state.allocator.transition(id, body.status).await?;
    Ok(ok("assignment updated", "assignment", assignment))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    outcome: AssignmentOutcome,
}

async fn complete_assignment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<CompleteRequest>,
) -> ApiResult {
    authorize(&state, &headers, "complete assignment")?;
    let assignment = state.allocator.complete(id, body.outcome).await?;
    Ok(ok("assignment completed", "assignment", assignment))
}

// ── Operator controls ───────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ReasonRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn kill_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReasonRequest>,
) -> ApiResult {
    authorize(&state, &headers, "kill")?;
    let reason = body.reason.unwrap_or_else(|| "operator request".to_string());
    info!(session_key = %session, reason = %reason, "Operator kill requested");
    let outcome = state.control.kill(&session, &reason).await?;
    Ok(outcome_response(outcome))
}

async fn pardon_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    authorize(&state, &headers, "pardon")?;
    let outcome = state.control.pardon(&session).await?;
    Ok(outcome_response(outcome))
}

// ── Ingestion ───────────────────────────────────────────────────────

async fn push_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<NewAgentEvent>,
) -> ApiResult {
    authorize(&state, &headers, "push event")?;
    let id = state.events.ingest(event).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": "event recorded", "id": id })),
    )
        .into_response())
}

async fn record_rate_limit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(obs): Json<RateObservation>,
) -> ApiResult {
    authorize(&state, &headers, "record rate limit")?;
    let window = state.ledger.record(obs).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": "rate limit recorded", "window": window })),
    )
        .into_response())
}

/// Usage report pushed by a provider integration.
#[derive(Debug, Deserialize)]
struct UsageReport {
    session_key: String,
    provider: String,
    model: String,
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cost_usd: Decimal,
    #[serde(default)]
    recorded_at: Option<DateTime<Utc>>,
}

async fn record_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<UsageReport>,
) -> ApiResult {
    authorize(&state, &headers, "record usage")?;
    let record = UsageRecord {
        session_key: report.session_key,
        provider: report.provider,
        model: report.model,
        input_tokens: report.input_tokens,
        output_tokens: report.output_tokens,
        cost_usd: report.cost_usd,
        recorded_at: report.recorded_at.unwrap_or_else(Utc::now).min(Utc::now()),
    };
    state.ledger.record_usage(record).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": "usage recorded" })),
    )
        .into_response())
}

// ── Budgets ─────────────────────────────────────────────────────────

async fn list_budgets(State(state): State<AppState>) -> ApiResult {
    let budgets = state.ledger.list_budgets().await?;
    Ok(ok(&format!("{} budget(s)", budgets.len()), "budgets", budgets))
}

async fn set_budget(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    Json(limits): Json<BudgetLimits>,
) -> ApiResult {
    authorize(&state, &headers, "set budget")?;
    let budget = state.ledger.set_budget(&agent, limits).await?;
    Ok(ok("budget updated", "budget", budget))
}

#[derive(Debug, Default, Deserialize)]
struct BudgetCheckRequest {
    #[serde(default)]
    estimated_cents: i64,
}

/// Pre-flight check before a model call. Blocked checks answer 200 with
/// `allowed: false`; the caller decides what to do.
async fn check_budget(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BudgetCheckRequest>,
) -> ApiResult {
    authorize(&state, &headers, "check budget")?;
    let check = state.ledger.check_budget(&agent, body.estimated_cents).await?;
    Ok(Json(json!({
        "success": true,
        "message": check.status,
        "allowed": check.allowed(),
        "check": check,
    }))
    .into_response())
}

async fn pause_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReasonRequest>,
) -> ApiResult {
    authorize(&state, &headers, "pause agent")?;
    let reason = body.reason.unwrap_or_else(|| "manual pause".to_string());
    let budget = state.ledger.pause(&agent, &reason).await?;
    Ok(ok("agent paused", "budget", budget))
}

async fn resume_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    authorize(&state, &headers, "resume agent")?;
    let budget = state.ledger.resume(&agent).await?;
    Ok(ok("agent resumed", "budget", budget))
}
