//! Cost/rate ledger.
//!
//! Stores provider rate-limit observations and per-session usage, answers
//! "how fast is this session burning" for the zombie detector, and enforces
//! per-agent spend budgets.

pub mod budget;
pub mod model;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, LedgerError};
use crate::store::Database;

pub use budget::{
    AgentBudget, BudgetCheck, BudgetLimits, BudgetPeriod, BudgetStatus, PeriodSpend,
    DEFAULT_ALERT_THRESHOLD,
};
pub use model::{BurnRate, MetricType, RateLimitWindow, UsageRecord, UsageSummary};

/// One rate-limit reading as reported by a provider integration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateObservation {
    pub provider: String,
    pub metric_type: MetricType,
    #[serde(default)]
    pub used: Option<i64>,
    pub limit: i64,
    #[serde(default)]
    pub remaining: Option<i64>,
    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Ledger {
    db: Arc<dyn Database>,
}

impl Ledger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Record a rate-limit observation.
    ///
    /// Whichever of `used` and `remaining` is missing is derived from the
    /// other; both are stored as reported when present.
    pub async fn record(&self, obs: RateObservation) -> Result<RateLimitWindow, DatabaseError> {
        let remaining = obs
            .remaining
            .or_else(|| obs.used.map(|used| obs.limit - used))
            .unwrap_or(obs.limit)
            .max(0);
        let used = obs.used.unwrap_or(obs.limit - remaining).max(0);
        let window = RateLimitWindow {
            provider: obs.provider,
            metric_type: obs.metric_type,
            used,
            limit: obs.limit,
            remaining,
            reset_at: obs.reset_at,
            recorded_at: Utc::now(),
        };
        self.db.insert_rate_limit(&window).await?;
        debug!(
            provider = %window.provider,
            metric = %window.metric_type,
            used = window.used,
            limit = window.limit,
            remaining = window.remaining,
            "Rate limit recorded"
        );
        if window.utilization() >= 0.9 {
            warn!(
                provider = %window.provider,
                metric = %window.metric_type,
                remaining = window.remaining,
                "Rate limit nearly exhausted"
            );
        }
        Ok(window)
    }

    /// Parse and record every rate-limit window present in a provider's
    /// response headers.
    pub async fn record_headers<I, K, V>(
        &self,
        provider: &str,
        headers: I,
    ) -> Result<Vec<RateLimitWindow>, DatabaseError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut recorded = Vec::new();
        for obs in windows_from_headers(provider, headers) {
            recorded.push(self.record(obs).await?);
        }
        Ok(recorded)
    }

    /// Newest observation per metric for a provider.
    pub async fn latest_windows(&self, provider: &str) -> Result<Vec<RateLimitWindow>, DatabaseError> {
        self.db.latest_rate_limits(provider).await
    }

    /// Attribute a model call's usage to a session.
    pub async fn record_usage(&self, record: UsageRecord) -> Result<(), DatabaseError> {
        self.db.insert_usage(&record).await?;
        debug!(
            session_key = %record.session_key,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost_usd = %record.cost_usd,
            "Usage recorded"
        );
        Ok(())
    }

    /// Total recorded usage of a session.
    pub async fn session_spend(&self, session_key: &str) -> Result<UsageSummary, DatabaseError> {
        self.db.usage_summary(session_key, None).await
    }

    /// Consumption of a session over the trailing `window`.
    pub async fn burn_rate(&self, session_key: &str, window: Duration) -> Result<BurnRate, DatabaseError> {
        self.burn_rate_at(session_key, window, Utc::now()).await
    }

    pub async fn burn_rate_at(
        &self,
        session_key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<BurnRate, DatabaseError> {
        let span = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let summary = self.db.usage_summary(session_key, Some(now - span)).await?;
        Ok(BurnRate {
            session_key: session_key.to_string(),
            window_secs: window.as_secs(),
            tokens: summary.total_tokens(),
            cost_usd: summary.cost_usd,
            calls: summary.calls,
        })
    }

    // ── Budgets ─────────────────────────────────────────────────────

    /// Create or update an agent's caps. Fields absent from `limits` keep
    /// their stored value; a new budget starts with the default threshold.
    pub async fn set_budget(
        &self,
        agent_id: &str,
        limits: BudgetLimits,
    ) -> Result<AgentBudget, LedgerError> {
        let invalid = |reason: &str| LedgerError::InvalidBudget {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        };
        if limits.is_empty() {
            return Err(invalid("no limits given"));
        }
        let caps = [limits.daily_cents, limits.weekly_cents, limits.monthly_cents];
        if caps.iter().flatten().any(|cents| *cents < 0) {
            return Err(invalid("limits cannot be negative"));
        }
        if limits.alert_threshold.is_some_and(|pct| !(1..=100).contains(&pct)) {
            return Err(invalid("alert threshold must be between 1 and 100"));
        }

        let current = self
            .db
            .get_budget(agent_id)
            .await?
            .unwrap_or_else(|| AgentBudget::new(agent_id));
        let budget = AgentBudget {
            daily_limit_cents: limits.daily_cents.or(current.daily_limit_cents),
            weekly_limit_cents: limits.weekly_cents.or(current.weekly_limit_cents),
            monthly_limit_cents: limits.monthly_cents.or(current.monthly_limit_cents),
            alert_threshold: limits.alert_threshold.unwrap_or(current.alert_threshold),
            updated_at: Utc::now(),
            ..current
        };
        self.db.upsert_budget(&budget).await?;
        info!(
            agent_id,
            daily_cents = ?budget.daily_limit_cents,
            weekly_cents = ?budget.weekly_limit_cents,
            monthly_cents = ?budget.monthly_limit_cents,
            alert_threshold = budget.alert_threshold,
            "Budget updated"
        );
        Ok(budget)
    }

    pub async fn budget(&self, agent_id: &str) -> Result<AgentBudget, LedgerError> {
        self.db
            .get_budget(agent_id)
            .await?
            .ok_or_else(|| LedgerError::BudgetNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    pub async fn list_budgets(&self) -> Result<Vec<AgentBudget>, LedgerError> {
        Ok(self.db.list_budgets().await?)
    }

    /// Block the agent until resumed.
    pub async fn pause(&self, agent_id: &str, reason: &str) -> Result<AgentBudget, LedgerError> {
        let paused = self.budget(agent_id).await?.paused_because(reason, Utc::now());
        self.db.upsert_budget(&paused).await?;
        info!(agent_id, reason, "Agent paused");
        Ok(paused)
    }

    pub async fn resume(&self, agent_id: &str) -> Result<AgentBudget, LedgerError> {
        let resumed = self.budget(agent_id).await?.resumed(Utc::now());
        self.db.upsert_budget(&resumed).await?;
        info!(agent_id, "Agent resumed");
        Ok(resumed)
    }

    /// Whether the agent may make a call estimated at `estimated_cents`.
    ///
    /// Agents without a budget are always allowed. A check that crosses a cap
    /// pauses the agent.
    pub async fn check_budget(
        &self,
        agent_id: &str,
        estimated_cents: i64,
    ) -> Result<BudgetCheck, LedgerError> {
        self.check_budget_at(agent_id, estimated_cents, Utc::now()).await
    }

    pub async fn check_budget_at(
        &self,
        agent_id: &str,
        estimated_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<BudgetCheck, LedgerError> {
        let Some(budget) = self.db.get_budget(agent_id).await? else {
            return Ok(BudgetCheck::unbudgeted(agent_id));
        };

        let mut spent = Vec::new();
        if !budget.paused {
            for period in BudgetPeriod::ALL {
                if budget.limit(period).is_none() {
                    continue;
                }
                let usd = self.db.agent_spend_since(agent_id, period.start(now)).await?;
                spent.push((period, to_cents(usd)));
            }
        }

        let check = budget::evaluate(&budget, &spent, estimated_cents);
        match check.status {
            BudgetStatus::Blocked if !budget.paused => {
                let reason = check.reason.clone().unwrap_or_default();
                self.db
                    .upsert_budget(&budget.paused_because(reason.clone(), now))
                    .await?;
                warn!(agent_id, reason = %reason, "Budget exceeded, agent paused");
            }
            BudgetStatus::Warning => {
                let periods: Vec<&str> = check.alerts.iter().map(|a| a.period.as_str()).collect();
                warn!(agent_id, periods = ?periods, "Agent approaching budget limit");
            }
            _ => {}
        }
        Ok(check)
    }
}

/// Whole cents, rounded up so a fraction of a cent still counts.
fn to_cents(usd: Decimal) -> i64 {
    (usd * Decimal::from(100)).ceil().to_i64().unwrap_or(i64::MAX)
}

const HEADER_PREFIX: &str = "anthropic-ratelimit-";

#[derive(Default)]
struct PartialWindow {
    limit: Option<i64>,
    remaining: Option<i64>,
    reset_at: Option<DateTime<Utc>>,
}

/// Extract rate-limit windows from `anthropic-ratelimit-*` response headers.
///
/// Header names are matched case-insensitively. A window is produced for
/// each metric that carries a parseable `limit`. Resets may be epoch seconds
/// or RFC 3339.
pub fn windows_from_headers<I, K, V>(provider: &str, headers: I) -> Vec<RateObservation>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    const METRICS: [MetricType; 4] = [
        MetricType::Requests,
        MetricType::Tokens,
        MetricType::InputTokens,
        MetricType::OutputTokens,
    ];
    let mut partial: [PartialWindow; 4] = Default::default();

    for (name, value) in headers {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.as_ref().trim();
        let Some(rest) = name.strip_prefix(HEADER_PREFIX) else {
            continue;
        };
        let Some((metric, field)) = rest.rsplit_once('-') else {
            continue;
        };
        let Ok(metric) = metric.parse::<MetricType>() else {
            continue;
        };
        let Some(idx) = METRICS.iter().position(|m| *m == metric) else {
            continue;
        };
        let slot = &mut partial[idx];
        match field {
            "limit" => slot.limit = value.parse().ok(),
            "remaining" => slot.remaining = value.parse().ok(),
            "reset" => slot.reset_at = parse_reset(value),
            _ => {}
        }
    }

    METRICS
        .iter()
        .zip(partial)
        .filter_map(|(metric, window)| {
            Some(RateObservation {
                provider: provider.to_string(),
                metric_type: *metric,
                used: None,
                limit: window.limit?,
                remaining: window.remaining,
                reset_at: window.reset_at,
            })
        })
        .collect()
}

fn parse_reset(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(secs) = value.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, NewAgentEvent};
    use crate::store::LibSqlBackend;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    async fn test_ledger() -> (Ledger, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (Ledger::new(Arc::clone(&db)), db)
    }

    fn usage(session: &str, input: i64, output: i64, cost: Decimal, at: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            session_key: session.into(),
            provider: "anthropic".into(),
            model: "sonnet".into(),
            input_tokens: input,
            output_tokens: output,
            cost_usd: cost,
            recorded_at: at,
        }
    }

    #[tokio::test]
    async fn record_derives_remaining_from_used() {
        let (ledger, _) = test_ledger().await;
        let window = ledger
            .record(RateObservation {
                provider: "anthropic".into(),
                metric_type: MetricType::Requests,
                used: Some(40),
                limit: 50,
                remaining: None,
                reset_at: None,
            })
            .await
            .unwrap();
        assert_eq!(window.remaining, 10);

        let latest = ledger.latest_windows("anthropic").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].used, 40);
    }

    #[tokio::test]
    async fn reported_usage_is_persisted_alongside_remaining() {
        let (ledger, _) = test_ledger().await;
        // Mid-reset readings need not add up; both sides are kept.
        ledger
            .record(RateObservation {
                provider: "anthropic".into(),
                metric_type: MetricType::OutputTokens,
                used: Some(35),
                limit: 50,
                remaining: Some(10),
                reset_at: None,
            })
            .await
            .unwrap();

        let latest = ledger.latest_windows("anthropic").await.unwrap();
        assert_eq!(latest[0].used, 35);
        assert_eq!(latest[0].remaining, 10);
        assert!((latest[0].utilization() - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn latest_windows_keeps_newest_per_metric() {
        let (ledger, _) = test_ledger().await;
        for remaining in [90, 70] {
            ledger
                .record(RateObservation {
                    provider: "anthropic".into(),
                    metric_type: MetricType::InputTokens,
                    used: None,
                    limit: 100,
                    remaining: Some(remaining),
                    reset_at: None,
                })
                .await
                .unwrap();
        }
        let latest = ledger.latest_windows("anthropic").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].remaining, 70);
        assert!(ledger.latest_windows("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn burn_rate_counts_only_the_window() {
        let (ledger, db) = test_ledger().await;
        let now = Utc::now();
        ledger
            .record_usage(usage("s", 1000, 500, dec!(0.02), now - chrono::Duration::minutes(30)))
            .await
            .unwrap();
        ledger
            .record_usage(usage("s", 2000, 1000, dec!(0.05), now - chrono::Duration::minutes(2)))
            .await
            .unwrap();
        ledger
            .record_usage(usage("other", 9000, 0, dec!(1), now))
            .await
            .unwrap();
        db.append_event(
            &NewAgentEvent::new("a", EventKind::ToolCall)
                .for_session("s")
                .with_tokens(500)
                .at(now - chrono::Duration::minutes(1)),
        )
        .await
        .unwrap();

        let rate = ledger
            .burn_rate_at("s", Duration::from_secs(600), now)
            .await
            .unwrap();
        assert_eq!(rate.tokens, 3500);
        assert_eq!(rate.cost_usd, dec!(0.05));
        assert_eq!(rate.calls, 2);

        let spend = ledger.session_spend("s").await.unwrap();
        assert_eq!(spend.cost_usd, dec!(0.07));
        assert_eq!(spend.total_tokens(), 5000);
    }

    #[test]
    fn parses_rate_limit_headers() {
        let headers = vec![
            ("Anthropic-RateLimit-Requests-Limit", "50"),
            ("anthropic-ratelimit-requests-remaining", "49"),
            ("anthropic-ratelimit-requests-reset", "2026-10-19T12:00:00Z"),
            ("anthropic-ratelimit-input-tokens-limit", "40000"),
            ("anthropic-ratelimit-input-tokens-remaining", "39000"),
            ("anthropic-ratelimit-input-tokens-reset", "1700000000"),
            ("anthropic-ratelimit-output-tokens-remaining", "100"),
            ("content-type", "application/json"),
        ];
        let windows = windows_from_headers("anthropic", headers);
        assert_eq!(windows.len(), 2);

        assert_eq!(windows[0].metric_type, MetricType::Requests);
        assert_eq!(windows[0].limit, 50);
        assert_eq!(windows[0].remaining, Some(49));
        assert_eq!(
            windows[0].reset_at.unwrap().to_rfc3339(),
            "2026-10-19T12:00:00+00:00"
        );

        assert_eq!(windows[1].metric_type, MetricType::InputTokens);
        assert_eq!(windows[1].reset_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn record_headers_stores_windows() {
        let (ledger, _) = test_ledger().await;
        let recorded = ledger
            .record_headers(
                "anthropic",
                [
                    ("anthropic-ratelimit-output-tokens-limit", "8000"),
                    ("anthropic-ratelimit-output-tokens-remaining", "800"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert!((recorded[0].utilization() - 0.9).abs() < 1e-9);
    }

    async fn agent_session(db: &Arc<dyn Database>, agent: &str, session: &str) {
        crate::runs::RunTracker::new(Arc::clone(db))
            .start_run(crate::runs::StartRun::new(session, agent))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn set_budget_merges_partial_updates() {
        let (ledger, _) = test_ledger().await;
        let err = ledger.set_budget("kevin", BudgetLimits::default()).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidBudget { .. }));
        let err = ledger
            .set_budget("kevin", BudgetLimits { alert_threshold: Some(150), ..BudgetLimits::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidBudget { .. }));

        ledger
            .set_budget("kevin", BudgetLimits { daily_cents: Some(500), ..BudgetLimits::default() })
            .await
            .unwrap();
        let budget = ledger
            .set_budget("kevin", BudgetLimits { weekly_cents: Some(2000), ..BudgetLimits::default() })
            .await
            .unwrap();
        assert_eq!(budget.daily_limit_cents, Some(500));
        assert_eq!(budget.weekly_limit_cents, Some(2000));
        assert_eq!(budget.alert_threshold, DEFAULT_ALERT_THRESHOLD);
        assert_eq!(ledger.list_budgets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn check_budget_warns_then_blocks_and_pauses() {
        let (ledger, db) = test_ledger().await;
        agent_session(&db, "kevin", "sess-k").await;
        let now = Utc::now();

        let check = ledger.check_budget_at("kevin", 0, now).await.unwrap();
        assert_eq!(check.status, BudgetStatus::Ok);
        assert!(check.allowed());

        ledger
            .set_budget("kevin", BudgetLimits { daily_cents: Some(500), ..BudgetLimits::default() })
            .await
            .unwrap();
        ledger
            .record_usage(usage("sess-k", 1000, 500, dec!(4.20), now))
            .await
            .unwrap();

        let check = ledger.check_budget_at("kevin", 0, now).await.unwrap();
        assert_eq!(check.status, BudgetStatus::Warning);
        assert_eq!(check.alerts[0].spent_cents, 420);

        // An estimate that would cross the cap blocks and pauses the agent.
        let check = ledger.check_budget_at("kevin", 100, now).await.unwrap();
        assert_eq!(check.status, BudgetStatus::Blocked);
        assert!(!check.allowed());
        let budget = ledger.budget("kevin").await.unwrap();
        assert!(budget.paused);
        assert_eq!(budget.paused_reason.as_deref(), Some("budget exceeded: daily"));

        // Paused stays blocked even for a free call, until resumed.
        let check = ledger.check_budget_at("kevin", 0, now).await.unwrap();
        assert_eq!(check.status, BudgetStatus::Blocked);
        ledger.resume("kevin").await.unwrap();
        let check = ledger.check_budget_at("kevin", 0, now).await.unwrap();
        assert_eq!(check.status, BudgetStatus::Warning);
    }

    #[tokio::test]
    async fn pause_requires_a_budget() {
        let (ledger, _) = test_ledger().await;
        let err = ledger.pause("ghost", "testing").await.unwrap_err();
        assert!(matches!(err, LedgerError::BudgetNotFound { .. }));

        ledger
            .set_budget("stuart", BudgetLimits { monthly_cents: Some(8000), ..BudgetLimits::default() })
            .await
            .unwrap();
        let paused = ledger.pause("stuart", "testing").await.unwrap();
        assert!(paused.paused);
        let check = ledger.check_budget("stuart", 0).await.unwrap();
        assert_eq!(check.status, BudgetStatus::Blocked);
        assert_eq!(check.reason.as_deref(), Some("testing"));
    }
}

