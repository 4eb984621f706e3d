//! Rate-limit and usage records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a rate-limit window counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Requests,
    Tokens,
    InputTokens,
    OutputTokens,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Tokens => "tokens",
            Self::InputTokens => "input_tokens",
            Self::OutputTokens => "output_tokens",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requests" => Ok(Self::Requests),
            "tokens" => Ok(Self::Tokens),
            "input_tokens" | "input-tokens" => Ok(Self::InputTokens),
            "output_tokens" | "output-tokens" => Ok(Self::OutputTokens),
            other => Err(format!("unknown metric type: {other}")),
        }
    }
}

/// A point-in-time observation of a provider rate-limit window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub provider: String,
    pub metric_type: MetricType,
    /// Consumption as reported, or `limit - remaining` when the provider
    /// only reports what is left.
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl RateLimitWindow {
    /// Fraction of the window consumed, 0.0 when the limit is unknown.
    pub fn utilization(&self) -> f64 {
        if self.limit <= 0 {
            return 0.0;
        }
        self.used as f64 / self.limit as f64
    }
}

/// Token and cost usage attributed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub session_key: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated usage over some span.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens reported directly on agent events rather than usage records.
    pub event_tokens: u64,
    pub cost_usd: Decimal,
    pub calls: u64,
}

impl UsageSummary {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.event_tokens
    }
}

/// Consumption rate for one session over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurnRate {
    pub session_key: String,
    pub window_secs: u64,
    pub tokens: u64,
    pub cost_usd: Decimal,
    pub calls: u64,
}

impl BurnRate {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn tokens_per_minute(&self) -> f64 {
        if self.window_secs == 0 {
            return 0.0;
        }
        self.tokens as f64 * 60.0 / self.window_secs as f64
    }

    pub fn cost_per_minute(&self) -> Decimal {
        if self.window_secs == 0 {
            return Decimal::ZERO;
        }
        (self.cost_usd * Decimal::from(60) / Decimal::from(self.window_secs)).round_dp(6)
    }
}
