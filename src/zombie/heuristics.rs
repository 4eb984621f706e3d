//! Pure zombie signals and the escalation policy.
//!
//! Nothing here touches the store; the detector gathers a [`RunObservation`]
//! and asks [`evaluate`] and [`decide`] what to do with it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ZombieConfig;
use crate::runs::{Run, ZombieStatus};

/// Outputs longer than this are truncated before comparison.
const MAX_COMPARED_CHARS: usize = 2_000;

/// Everything the detector knows about one running run at scan time.
#[derive(Debug, Clone)]
pub struct RunObservation {
    pub run: Run,
    /// Latest non-heartbeat, non-supervisory event.
    pub last_activity: Option<DateTime<Utc>>,
    /// `output` payloads of recent events, newest first.
    pub recent_outputs: Vec<String>,
    /// Detail payloads of recent `tool_call` events, newest first.
    pub recent_tool_calls: Vec<serde_json::Value>,
    /// Tokens consumed inside the burn window.
    pub burn_tokens: u64,
}

/// Independently computed zombie signals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Signals {
    pub silence_secs: i64,
    pub stagnation_secs: i64,
    pub burn_tokens: u64,
    pub silent: bool,
    pub stagnant: bool,
    /// Non-trivial spend while silent or stagnant.
    pub burning: bool,
    pub repetition: bool,
    pub stuck_loop: bool,
}

impl Signals {
    pub fn any(&self) -> bool {
        self.silent || self.stagnant || self.burning || self.repetition || self.stuck_loop
    }

    /// Names of the signals that fired.
    pub fn reasons(&self) -> Vec<&'static str> {
        [
            (self.silent, "silence"),
            (self.stagnant, "stagnation"),
            (self.burning, "burn_without_progress"),
            (self.repetition, "repetition"),
            (self.stuck_loop, "stuck_loop"),
        ]
        .into_iter()
        .filter_map(|(fired, name)| fired.then_some(name))
        .collect()
    }
}

/// What the detector should do with a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No signal and nothing to undo.
    Healthy,
    /// Signals cleared on a suspected run: back to `none`.
    Recovered,
    /// Kill (auto mode) or flag for an operator (supervised mode).
    Escalate,
    /// `none → suspected`.
    Suspect,
    /// Already suspected, not yet past the kill threshold.
    StillSuspected,
}

pub fn evaluate(obs: &RunObservation, cfg: &ZombieConfig, now: DateTime<Utc>) -> Signals {
    let run = &obs.run;

    let quiet_since = [obs.last_activity, run.pardoned_at]
        .into_iter()
        .flatten()
        .fold(run.started_at, |acc, t| acc.max(t));
    let silence_secs = (now - quiet_since).num_seconds().max(0);
    let stagnation_secs = (now - run.progress_anchor()).num_seconds().max(0);

    let silent = silence_secs >= cfg.silence_threshold.as_secs() as i64;
    let stagnant = stagnation_secs >= cfg.stagnation_threshold.as_secs() as i64;
    let burning = cfg.burn_min_tokens > 0
        && obs.burn_tokens >= cfg.burn_min_tokens
        && (silent || stagnant);

    Signals {
        silence_secs,
        stagnation_secs,
        burn_tokens: obs.burn_tokens,
        silent,
        stagnant,
        burning,
        repetition: is_repeating(&obs.recent_outputs, cfg.repetition_window, cfg.repetition_similarity),
        stuck_loop: is_stuck_loop(&obs.recent_tool_calls, cfg.stuck_loop_calls),
    }
}

/// Escalation policy. The first matching rule wins.
pub fn decide(status: ZombieStatus, signals: &Signals, cfg: &ZombieConfig) -> Verdict {
    let status = status.normalized();
    if !signals.any() {
        return match status {
            ZombieStatus::Suspected => Verdict::Recovered,
            _ => Verdict::Healthy,
        };
    }

    let kill_secs = cfg.kill_threshold.as_secs() as i64;
    let overdue = signals.silence_secs >= kill_secs || signals.stagnation_secs >= kill_secs;
    if signals.burning || (status == ZombieStatus::Suspected && overdue) {
        return Verdict::Escalate;
    }

    match status {
        ZombieStatus::Suspected => Verdict::StillSuspected,
        _ => Verdict::Suspect,
    }
}

/// The newest output is matched against the last `window` outputs (itself
/// included); enough near-duplicates means the agent is repeating itself.
pub fn is_repeating(outputs: &[String], window: usize, threshold: f64) -> bool {
    if window == 0 || outputs.len() < window {
        return false;
    }
    let recent = &outputs[..window];
    let newest = &recent[0];
    let similar = recent
        .iter()
        .filter(|output| similarity(newest, output) > threshold)
        .count();
    similar as f64 >= window as f64 * threshold
}

/// The last `calls` tool calls carry identical detail.
pub fn is_stuck_loop(tool_calls: &[serde_json::Value], calls: usize) -> bool {
    if calls < 2 || tool_calls.len() < calls {
        return false;
    }
    let first = &tool_calls[0];
    tool_calls[1..calls].iter().all(|call| call == first)
}

/// `(longer - distance) / longer`, case-insensitive. Two empty strings are
/// identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().take(MAX_COMPARED_CHARS).collect();
    let b: Vec<char> = b.to_lowercase().chars().take(MAX_COMPARED_CHARS).collect();
    let longer = a.len().max(b.len());
    if longer == 0 {
        return 1.0;
    }
    (longer - edit_distance(&a, &b)) as f64 / longer as f64
}

/// Levenshtein distance over chars, single rolling row.
pub fn edit_distance(a: &[char], b: &[char]) -> usize {
    let mut costs: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = costs[0];
        costs[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = costs[j + 1];
            costs[j + 1] = if ca == cb {
                diagonal
            } else {
                diagonal.min(above).min(costs[j]) + 1
            };
            diagonal = above;
        }
    }
    costs[b.len()]
}
