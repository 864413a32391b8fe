//! Periodic driver.
//!
//! The engine owns no timers. Something outside it must call
//! [`Engine::tick`] regularly; [`Ticker`] is the in-process loop that does
//! so until cancelled. Each tick advances every unfinished instance whose
//! `paused_until` has elapsed.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::repository::AutomationStore;

use super::action::panic_message;
use super::advance::RunOutcome;
use super::engine::Engine;
use super::error::EngineError;

/// Summary of one driver pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Runnable instances found.
    pub examined: usize,
    /// Instances advanced without error.
    pub advanced: usize,
    /// Instances that reached a terminal state during this pass.
    pub finished: usize,
    /// Instances not advanced (unregistered class, finished concurrently).
    pub skipped: usize,
    /// Instances marked finished because an error escaped their run.
    pub failed: Vec<(Uuid, String)>,
}

impl<S: AutomationStore + 'static> Engine<S> {
    /// Advance every unfinished instance due at `now`.
    ///
    /// An error escaping an instance's run finishes that instance; it does
    /// not abort the pass.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let runnable = self.store().list_runnable(now).await?;
        let mut report = TickReport {
            examined: runnable.len(),
            ..TickReport::default()
        };

        for record in runnable {
            let id = record.id;
            let automation = match self.bind_record(record) {
                Ok(automation) => automation,
                Err(err) => {
                    warn!(automation_id = %id, error = %err, "skipping automation");
                    report.skipped += 1;
                    continue;
                }
            };

            let span = info_span!("advance", automation_id = %id, class = %automation.class());
            let run = AssertUnwindSafe(automation.run_at(now).instrument(span))
                .catch_unwind()
                .await;
            let result = match run {
                Ok(result) => result,
                Err(payload) => {
                    let message = format!("advancement panicked: {}", panic_message(&*payload));
                    self.fail(&id, message, &mut report).await;
                    continue;
                }
            };
            match result {
                Ok(outcome) => {
                    report.advanced += 1;
                    if outcome == RunOutcome::Finished {
                        report.finished += 1;
                    }
                }
                Err(EngineError::AlreadyFinished(_)) => {
                    debug!(automation_id = %id, "finished by a concurrent advancer");
                    report.skipped += 1;
                }
                Err(err) => self.fail(&id, err.to_string(), &mut report).await,
            }
        }

        info!(
            examined = report.examined,
            advanced = report.advanced,
            finished = report.finished,
            skipped = report.skipped,
            failed = report.failed.len(),
            "tick complete"
        );
        Ok(report)
    }

    /// Finish an instance whose run escaped with an error. The instance may
    /// already be gone (killed mid-run), which is logged and otherwise ignored.
    async fn fail(&self, id: &Uuid, message: String, report: &mut TickReport) {
        error!(automation_id = %id, error = %message, "automation failed, marking finished");
        if let Err(e) = self.store().set_finished(id).await {
            warn!(automation_id = %id, error = %e, "could not mark failed automation finished");
        }
        report.failed.push((*id, message));
    }
}

/// Calls [`Engine::tick`] on a fixed interval until cancelled.
pub struct Ticker<S> {
    engine: Engine<S>,
    interval: Duration,
}

impl<S: AutomationStore + 'static> Ticker<S> {
    /// Tick at the engine's configured `tick_interval_secs`.
    pub fn new(engine: Engine<S>) -> Self {
        let interval = Duration::from_secs(engine.config().tick_interval_secs.max(1));
        Self { engine, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until `cancel` fires. Returns the number of completed ticks.
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = 0u64;

        info!(interval_secs = self.interval.as_secs_f64(), "ticker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(ticks, "ticker stopped");
                    break;
                }
                _ = timer.tick() => {
                    match self.engine.tick(Utc::now()).await {
                        Ok(report) => debug!(?report, "tick"),
                        Err(err) => error!(error = %err, "tick failed"),
                    }
                    ticks += 1;
                }
            }
        }
        ticks
    }
}
