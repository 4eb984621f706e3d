//! Periodic zombie scan over running runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::claims::FileClaimManager;
use crate::config::{ZombieConfig, ZombieMode};
use crate::error::{DatabaseError, Error};
use crate::events::{EventKind, EventLog, NewAgentEvent};
use crate::ledger::Ledger;
use crate::runs::{Run, RunStatus, ZombieStatus};
use crate::store::{CommitOutcome, Database, Mutation};

use super::control::ZombieControl;
use super::heuristics::{self, RunObservation, Signals, Verdict};

/// Agent id stamped on events the detector writes.
const DETECTOR_AGENT: &str = "foreman";

/// Tally of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub suspected: usize,
    pub killed: usize,
    pub pending_kill: usize,
    pub recovered: usize,
    pub errors: usize,
    pub claims_reconciled: usize,
}

impl ScanReport {
    pub fn changed_anything(&self) -> bool {
        self.suspected + self.killed + self.pending_kill + self.recovered + self.claims_reconciled > 0
    }
}

/// What a single run check did.
enum Action {
    None,
    Suspected,
    Killed,
    PendingKill,
    Recovered,
}

pub struct ZombieDetector {
    db: Arc<dyn Database>,
    events: EventLog,
    ledger: Ledger,
    claims: FileClaimManager,
    control: ZombieControl,
    config: ZombieConfig,
}

impl ZombieDetector {
    pub fn new(db: Arc<dyn Database>, control: ZombieControl, config: ZombieConfig) -> Self {
        Self {
            events: EventLog::new(Arc::clone(&db)),
            ledger: Ledger::new(Arc::clone(&db)),
            claims: FileClaimManager::new(Arc::clone(&db)),
            db,
            control,
            config,
        }
    }

    pub fn config(&self) -> &ZombieConfig {
        &self.config
    }

    pub async fn scan(&self) -> Result<ScanReport, DatabaseError> {
        self.scan_at(Utc::now()).await
    }

    /// Evaluate every running run as of `now`, then reconcile orphaned claims.
    ///
    /// A failure on one run is logged and counted; the scan moves on.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<ScanReport, DatabaseError> {
        let runs = self.db.list_runs_by_status(RunStatus::Running).await?;
        let mut report = ScanReport {
            scanned: runs.len(),
            ..ScanReport::default()
        };

        for run in runs {
            match self.check_run(&run, now).await {
                Ok(Action::None) => {}
                Ok(Action::Suspected) => report.suspected += 1,
                Ok(Action::Killed) => report.killed += 1,
                Ok(Action::PendingKill) => report.pending_kill += 1,
                Ok(Action::Recovered) => report.recovered += 1,
                Err(e) => {
                    warn!(run_id = %run.id, session_key = %run.session_key, error = %e, "Zombie check failed");
                    report.errors += 1;
                }
            }
        }

        match self.claims.reconcile().await {
            Ok(released) => report.claims_reconciled = released,
            Err(e) => {
                warn!(error = %e, "Claim reconciliation failed");
                report.errors += 1;
            }
        }

        Ok(report)
    }

    async fn observe(&self, run: &Run, now: DateTime<Utc>) -> Result<RunObservation, DatabaseError> {
        let session = run.session_key.as_str();
        let after_pardon = |at: &DateTime<Utc>| run.pardoned_at.is_none_or(|p| *at > p);

        let window = self.config.repetition_window;
        let recent_outputs = if window == 0 {
            Vec::new()
        } else {
            self.events
                .recent(session, window * 4)
                .await?
                .into_iter()
                .filter(|e| after_pardon(&e.created_at) && !e.output_text().is_empty())
                .take(window)
                .map(|e| e.output_text().to_string())
                .collect()
        };

        let calls = self.config.stuck_loop_calls;
        let recent_tool_calls = if calls == 0 {
            Vec::new()
        } else {
            self.events
                .recent_of_kind(session, &EventKind::ToolCall, calls)
                .await?
                .into_iter()
                .filter(|e| after_pardon(&e.created_at))
                .map(|e| e.detail)
                .collect()
        };

        let burn = self
            .ledger
            .burn_rate_at(session, self.config.burn_window, now)
            .await?;

        Ok(RunObservation {
            run: run.clone(),
            last_activity: self.events.last_activity(session).await?,
            recent_outputs,
            recent_tool_calls,
            burn_tokens: burn.tokens,
        })
    }

    async fn check_run(&self, run: &Run, now: DateTime<Utc>) -> Result<Action, Error> {
        let obs = self.observe(run, now).await?;
        let signals = heuristics::evaluate(&obs, &self.config, now);
        let verdict = heuristics::decide(run.zombie_status, &signals, &self.config);
        debug!(
            session_key = %run.session_key,
            silence_secs = signals.silence_secs,
            stagnation_secs = signals.stagnation_secs,
            verdict = ?verdict,
            "Zombie check"
        );

        match verdict {
            Verdict::Healthy | Verdict::StillSuspected => Ok(Action::None),
            Verdict::Recovered => {
                let recovered = Run {
                    suspected_at: None,
                    ..run.zombie_moved_to(ZombieStatus::None)?
                };
                if !self.save(recovered, check_event(run, "recovered", &signals, now)).await? {
                    return Ok(Action::None);
                }
                info!(session_key = %run.session_key, run_id = %run.id, "Suspected run recovered");
                Ok(Action::Recovered)
            }
            Verdict::Suspect => {
                if !self.suspect(run, &signals, now).await? {
                    return Ok(Action::None);
                }
                Ok(Action::Suspected)
            }
            Verdict::Escalate => self.escalate(run, &signals, now).await,
        }
    }

    async fn suspect(&self, run: &Run, signals: &Signals, now: DateTime<Utc>) -> Result<bool, Error> {
        let suspected = Run {
            suspected_at: Some(now),
            ..run.zombie_moved_to(ZombieStatus::Suspected)?
        };
        let saved = self
            .save(suspected, check_event(run, "suspected", signals, now))
            .await?;
        if saved {
            warn!(
                session_key = %run.session_key,
                run_id = %run.id,
                agent_id = %run.agent_id,
                reasons = ?signals.reasons(),
                "Run suspected as zombie"
            );
        }
        Ok(saved)
    }

    async fn escalate(&self, run: &Run, signals: &Signals, now: DateTime<Utc>) -> Result<Action, Error> {
        let reasons = signals.reasons().join(", ");
        match self.config.mode {
            ZombieMode::Auto => {
                let outcome = self
                    .control
                    .kill(&run.session_key, &format!("zombie detector: {reasons}"))
                    .await?;
                if let Some(caveat) = &outcome.caveat {
                    warn!(session_key = %run.session_key, caveat = %caveat, "Kill committed with caveat");
                }
                Ok(Action::Killed)
            }
            ZombieMode::Supervised => {
                let pending = self
                    .events
                    .recent_of_kind(&run.session_key, &EventKind::ZombieCheck, 1)
                    .await?
                    .first()
                    .is_some_and(|e| {
                        e.detail["verdict"] == "pending_kill"
                            && run.pardoned_at.is_none_or(|p| e.created_at > p)
                    });
                if pending {
                    return Ok(Action::None);
                }

                let flagged = Run {
                    suspected_at: run.suspected_at.or(Some(now)),
                    ..run.zombie_moved_to(ZombieStatus::Suspected)?
                };
                if !self
                    .save(flagged, check_event(run, "pending_kill", signals, now))
                    .await?
                {
                    return Ok(Action::None);
                }
                warn!(
                    session_key = %run.session_key,
                    run_id = %run.id,
                    reasons = %reasons,
                    "Run awaiting operator kill"
                );
                Ok(Action::PendingKill)
            }
        }
    }

    /// Save the run with a zombie_check event. `false` if the run moved on
    /// since it was read.
    async fn save(&self, run: Run, event: NewAgentEvent) -> Result<bool, Error> {
        let run_id = run.id;
        match self
            .db
            .commit(&[Mutation::SaveRun(run), Mutation::AppendEvent(event)])
            .await?
        {
            CommitOutcome::Committed => Ok(true),
            CommitOutcome::Stale { .. } => {
                debug!(run_id = %run_id, "Run changed during zombie check, skipping");
                Ok(false)
            }
        }
    }
}

fn check_event(run: &Run, verdict: &str, signals: &Signals, now: DateTime<Utc>) -> NewAgentEvent {
    NewAgentEvent::new(DETECTOR_AGENT, EventKind::ZombieCheck)
        .for_session(run.session_key.clone())
        .with_detail(serde_json::json!({
            "run_id": run.id,
            "agent_id": run.agent_id,
            "verdict": verdict,
            "reasons": signals.reasons(),
            "signals": signals,
        }))
        .at(now)
}

/// Spawn the detector loop. The first scan runs immediately.
pub fn spawn_zombie_detector(detector: Arc<ZombieDetector>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), mode = ?detector.config().mode, "Zombie detector started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            match detector.scan().await {
                Ok(report) if report.changed_anything() || report.errors > 0 => info!(
                    scanned = report.scanned,
                    suspected = report.suspected,
                    killed = report.killed,
                    pending_kill = report.pending_kill,
                    recovered = report.recovered,
                    claims_reconciled = report.claims_reconciled,
                    errors = report.errors,
                    "Zombie scan complete"
                ),
                Ok(report) => debug!(scanned = report.scanned, "Zombie scan: all runs healthy"),
                Err(e) => warn!(error = %e, "Zombie scan failed"),
            }
        }
    })
}
