//! Per-agent spend caps.
//!
//! A budget caps an agent's spend per calendar day, week (Monday start) and
//! month, in cents. A check projects the spend of an upcoming call onto each
//! configured period: at the alert threshold the call is allowed with a
//! warning, at 100% it is blocked and the agent is paused until an operator
//! resumes it.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert threshold applied when none is configured, in percent.
pub const DEFAULT_ALERT_THRESHOLD: i64 = 80;

/// Calendar period a cap applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    pub const ALL: [BudgetPeriod; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Start of the period containing `now`, in UTC.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let first = match self {
            Self::Daily => today,
            Self::Weekly => today - Duration::days(i64::from(today.weekday().num_days_from_monday())),
            Self::Monthly => NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today),
        };
        first.and_time(NaiveTime::MIN).and_utc()
    }
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spend caps and pause state of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBudget {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_limit_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_limit_cents: Option<i64>,
    /// Percent of a cap at which checks start warning.
    pub alert_threshold: i64,
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentBudget {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            daily_limit_cents: None,
            weekly_limit_cents: None,
            monthly_limit_cents: None,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            paused: false,
            paused_at: None,
            paused_reason: None,
            updated_at: Utc::now(),
        }
    }

    /// Cap for a period. Unset and zero caps are unlimited.
    pub fn limit(&self, period: BudgetPeriod) -> Option<i64> {
        let limit = match period {
            BudgetPeriod::Daily => self.daily_limit_cents,
            BudgetPeriod::Weekly => self.weekly_limit_cents,
            BudgetPeriod::Monthly => self.monthly_limit_cents,
        };
        limit.filter(|cents| *cents > 0)
    }

    pub(crate) fn paused_because(&self, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            paused: true,
            paused_at: Some(at),
            paused_reason: Some(reason.into()),
            updated_at: at,
            ..self.clone()
        }
    }

    pub(crate) fn resumed(&self, at: DateTime<Utc>) -> Self {
        Self {
            paused: false,
            paused_at: None,
            paused_reason: None,
            updated_at: at,
            ..self.clone()
        }
    }
}

/// Partial update of a budget. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BudgetLimits {
    #[serde(default)]
    pub daily_cents: Option<i64>,
    #[serde(default)]
    pub weekly_cents: Option<i64>,
    #[serde(default)]
    pub monthly_cents: Option<i64>,
    #[serde(default)]
    pub alert_threshold: Option<i64>,
}

impl BudgetLimits {
    pub fn is_empty(&self) -> bool {
        self.daily_cents.is_none()
            && self.weekly_cents.is_none()
            && self.monthly_cents.is_none()
            && self.alert_threshold.is_none()
    }
}

/// Verdict of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Blocked,
}

/// Spend against one cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSpend {
    pub period: BudgetPeriod,
    pub spent_cents: i64,
    /// Spend including the estimated cost of the call being checked.
    pub projected_cents: i64,
    pub limit_cents: i64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub agent_id: String,
    pub status: BudgetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub alerts: Vec<PeriodSpend>,
    pub blocks: Vec<PeriodSpend>,
}

impl BudgetCheck {
    pub fn allowed(&self) -> bool {
        self.status != BudgetStatus::Blocked
    }

    /// Check result for an agent without a budget: always allowed.
    pub fn unbudgeted(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: BudgetStatus::Ok,
            reason: Some("no budget configured".to_string()),
            alerts: Vec::new(),
            blocks: Vec::new(),
        }
    }
}

/// Judge `spent` (cents per period) plus `estimated_cents` against a budget.
///
/// Periods missing from `spent` count as zero spend.
pub fn evaluate(budget: &AgentBudget, spent: &[(BudgetPeriod, i64)], estimated_cents: i64) -> BudgetCheck {
    if budget.paused {
        return BudgetCheck {
            agent_id: budget.agent_id.clone(),
            status: BudgetStatus::Blocked,
            reason: Some(
                budget
                    .paused_reason
                    .clone()
                    .unwrap_or_else(|| "agent paused".to_string()),
            ),
            alerts: Vec::new(),
            blocks: Vec::new(),
        };
    }

    let mut alerts = Vec::new();
    let mut blocks = Vec::new();
    for period in BudgetPeriod::ALL {
        let Some(limit) = budget.limit(period) else {
            continue;
        };
        let spent_cents = spent
            .iter()
            .find(|(p, _)| *p == period)
            .map(|(_, cents)| *cents)
            .unwrap_or(0);
        let projected_cents = spent_cents.saturating_add(estimated_cents.max(0));
        let percent = projected_cents as f64 * 100.0 / limit as f64;
        let usage = PeriodSpend {
            period,
            spent_cents,
            projected_cents,
            limit_cents: limit,
            percent,
        };
        if percent >= 100.0 {
            blocks.push(usage);
        } else if percent >= budget.alert_threshold as f64 {
            alerts.push(usage);
        }
    }

    let (status, reason) = if !blocks.is_empty() {
        let periods: Vec<&str> = blocks.iter().map(|b| b.period.as_str()).collect();
        (
            BudgetStatus::Blocked,
            Some(format!("budget exceeded: {}", periods.join(", "))),
        )
    } else if !alerts.is_empty() {
        (BudgetStatus::Warning, None)
    } else {
        (BudgetStatus::Ok, None)
    };

    BudgetCheck {
        agent_id: budget.agent_id.clone(),
        status,
        reason,
        alerts,
        blocks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> AgentBudget {
        AgentBudget {
            daily_limit_cents: Some(500),
            weekly_limit_cents: Some(2000),
            ..AgentBudget::new("kevin")
        }
    }

    #[test]
    fn period_starts() {
        // 2026-10-21 is a Wednesday.
        let now = DateTime::parse_from_rfc3339("2026-10-21T15:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(BudgetPeriod::Daily.start(now).to_rfc3339(), "2026-10-21T00:00:00+00:00");
        assert_eq!(BudgetPeriod::Weekly.start(now).to_rfc3339(), "2026-10-19T00:00:00+00:00");
        assert_eq!(BudgetPeriod::Monthly.start(now).to_rfc3339(), "2026-10-01T00:00:00+00:00");
    }

    #[test]
    fn warns_at_threshold_and_blocks_at_cap() {
        let b = budget();

        let ok = evaluate(&b, &[(BudgetPeriod::Daily, 100)], 0);
        assert_eq!(ok.status, BudgetStatus::Ok);

        let warn = evaluate(&b, &[(BudgetPeriod::Daily, 400)], 0);
        assert_eq!(warn.status, BudgetStatus::Warning);
        assert!(warn.allowed());
        assert_eq!(warn.alerts.len(), 1);
        assert_eq!(warn.alerts[0].period, BudgetPeriod::Daily);

        // The estimate of the upcoming call tips it over.
        let blocked = evaluate(&b, &[(BudgetPeriod::Daily, 450), (BudgetPeriod::Weekly, 450)], 50);
        assert_eq!(blocked.status, BudgetStatus::Blocked);
        assert!(!blocked.allowed());
        assert_eq!(blocked.reason.as_deref(), Some("budget exceeded: daily"));
        assert_eq!(blocked.blocks[0].projected_cents, 500);
    }

    #[test]
    fn unset_and_zero_caps_are_unlimited() {
        let b = AgentBudget {
            daily_limit_cents: Some(0),
            ..AgentBudget::new("stuart")
        };
        let check = evaluate(&b, &[(BudgetPeriod::Daily, 1_000_000)], 0);
        assert_eq!(check.status, BudgetStatus::Ok);
        assert!(check.blocks.is_empty());
    }

    #[test]
    fn paused_budget_blocks_regardless_of_spend() {
        let b = budget().paused_because("manual pause", Utc::now());
        let check = evaluate(&b, &[], 0);
        assert_eq!(check.status, BudgetStatus::Blocked);
        assert_eq!(check.reason.as_deref(), Some("manual pause"));

        let check = evaluate(&b.resumed(Utc::now()), &[], 0);
        assert_eq!(check.status, BudgetStatus::Ok);
    }
}
