//! Daily expiration sweep scheduling
//!
//! The sweep keeps no "last run" state: each run is a function of the clock
//! and the stored rows, so a missed or repeated run is harmless.

use crate::config::SweepConfig;
use crate::engine::CreditEngine;
use crate::sweeper::SweepReport;
use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Times of day (UTC) at which the sweep runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSchedule {
    times: Vec<NaiveTime>,
}

impl SweepSchedule {
    /// Parse `HH:MM` run times
    pub fn from_config(config: &SweepConfig) -> Result<Self> {
        let mut times = config
            .run_times
            .iter()
            .map(|time_str| {
                NaiveTime::parse_from_str(time_str, "%H:%M").map_err(|e| {
                    Error::Config(format!("Invalid time format '{}': {}", time_str, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if times.is_empty() {
            return Err(Error::Config("No sweep run times configured".to_string()));
        }
        times.sort();
        times.dedup();

        Ok(Self { times })
    }

    /// First run time strictly after `now`
    pub fn next_run_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let current_time = now.time();
        let today = now.date_naive();

        if let Some(run_time) = self.times.iter().find(|t| current_time < **t) {
            return Ok(today.and_time(*run_time).and_utc());
        }

        let tomorrow = (now + Duration::days(1)).date_naive();
        let first = self
            .times
            .first()
            .ok_or_else(|| Error::Config("No sweep run times configured".to_string()))?;
        Ok(tomorrow.and_time(*first).and_utc())
    }
}

/// Runs [`CreditEngine::sweep`] on a [`SweepSchedule`] until shut down
#[derive(Debug)]
pub struct SweepScheduler {
    engine: Arc<CreditEngine>,
    schedule: SweepSchedule,
}

impl SweepScheduler {
    /// Create scheduler
    pub fn new(engine: Arc<CreditEngine>, schedule: SweepSchedule) -> Self {
        Self { engine, schedule }
    }

    /// Sweep once now, off the async executor
    pub async fn run_once(&self) -> Result<SweepReport> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.sweep())
            .await
            .map_err(|e| Error::Storage(format!("Sweep task failed: {}", e)))?
    }

    /// Loop until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(times = ?self.schedule.times, "Starting sweep scheduler");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = self.engine.now();
            let next = self.schedule.next_run_time(now)?;
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(next_run = %next, wait_secs = wait.as_secs(), "Next sweep scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.run_once().await {
                        Ok(report) => info!(
                            contributions_expired = report.contributions_expired,
                            credits_expired = report.credits_expired,
                            "Scheduled sweep finished"
                        ),
                        Err(e) => warn!(error = %e, "Scheduled sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Sweep scheduler stopped");
        Ok(())
    }
}
