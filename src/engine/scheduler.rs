use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use super::TradingEngine;
use crate::error::EngineError;
use crate::execution::ExitReason;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub cycle_interval_secs: u64,
    /// Longest single sleep; the wall clock is re-read after each chunk
    pub wait_chunk_secs: u64,
    /// File touched once per chunk for external watchdogs
    pub liveness_marker: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 3600, // hourly
            wait_chunk_secs: 60,
            liveness_marker: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Stopped,
}

/// Next deadline after `previous`, skipping any that already passed
pub fn next_deadline(
    previous: DateTime<Utc>,
    interval: chrono::Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let mut next = previous + interval;
    if next <= now {
        let missed = (now - previous).num_milliseconds() / interval.num_milliseconds().max(1);
        next = previous + interval * (missed as i32 + 1);
        tracing::warn!(missed = missed, next = %next, "⏭️  Skipping missed cycles");
    }
    next
}

/// Drives `TradingEngine::run_cycle` on a fixed wall-clock cadence
pub struct CycleScheduler {
    config: SchedulerConfig,
}

impl CycleScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.cycle_interval_secs.max(1) as i64)
    }

    fn touch_liveness(&self, now: DateTime<Utc>) {
        if let Some(path) = &self.config.liveness_marker {
            if let Err(e) = std::fs::write(path, now.to_rfc3339()) {
                tracing::warn!(path = %path.display(), "Failed to touch liveness marker: {}", e);
            }
        }
    }

    /// Sleep in chunks until `deadline`, or until the stop signal fires
    ///
    /// The wall clock is re-read after every chunk, so a suspended host
    /// resumes close to schedule.
    pub async fn wait_until(
        &self,
        engine: &mut TradingEngine,
        deadline: DateTime<Utc>,
        stop: &mut watch::Receiver<bool>,
    ) -> WaitOutcome {
        let chunk = Duration::from_secs(self.config.wait_chunk_secs.max(1));

        loop {
            if *stop.borrow() {
                return WaitOutcome::Stopped;
            }

            let now = Utc::now();
            self.touch_liveness(now);
            engine.observe_market();

            let remaining = match (deadline - now).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => return WaitOutcome::Elapsed,
            };

            tokio::select! {
                _ = tokio::time::sleep(remaining.min(chunk)) => {}
                changed = stop.changed() => {
                    // A dropped sender can never signal again; keep the schedule
                    if changed.is_err() {
                        tokio::time::sleep(remaining.min(chunk)).await;
                    }
                }
            }
        }
    }

    /// Run cycles until stopped or a fatal error
    ///
    /// On stop every open position is liquidated before returning.
    pub async fn run(
        &self,
        engine: &mut TradingEngine,
        mut stop: watch::Receiver<bool>,
    ) -> crate::Result<()> {
        tracing::info!(
            interval_secs = self.config.cycle_interval_secs,
            chunk_secs = self.config.wait_chunk_secs,
            "⏰ Scheduler started"
        );

        let interval = self.interval();
        let mut deadline = Utc::now();

        loop {
            if *stop.borrow() {
                break;
            }

            let started = Utc::now();
            match engine.run_cycle(started).await {
                Ok(report) => {
                    tracing::debug!(
                        opened = report.opened.len(),
                        closed = report.closed.len(),
                        "Cycle report"
                    );
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("🛑 Fatal error, halting: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("⚠️  Cycle failed, continuing: {}", e);
                }
            }

            deadline = next_deadline(deadline, interval, Utc::now());
            tracing::info!(next = %deadline, "💤 Waiting for next cycle");

            if self.wait_until(engine, deadline, &mut stop).await == WaitOutcome::Stopped {
                break;
            }
        }

        tracing::warn!("🛑 Stop requested, liquidating open positions");
        let report = engine
            .liquidate_all(ExitReason::EmergencyStop, Utc::now())
            .await;

        if !report.failed.is_empty() {
            return Err(EngineError::Fatal(format!(
                "{} positions could not be liquidated on shutdown",
                report.failed.len()
            )));
        }

        tracing::info!(closed = report.closed.len(), "Liquidation complete");
        Ok(())
    }
}
