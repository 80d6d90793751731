//! Sweep scheduler
//!
//! Runs the expired-period sweep on the primary cadence and the stale
//! past-due sweep on the secondary cadence. Only one sweep runs at a time;
//! a tick that finds another sweep still running is skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::service::BillingService;
use crate::sweep::{SweepKind, SweepReport};

/// Periodic sweep driver
#[derive(Clone)]
pub struct SweepScheduler {
    service: Arc<BillingService>,
    primary: Duration,
    secondary: Duration,
    running: Arc<Mutex<()>>,
}

impl SweepScheduler {
    pub fn new(service: Arc<BillingService>, primary: Duration, secondary: Duration) -> Self {
        Self {
            service,
            primary,
            secondary,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Tick forever. Abort the task to stop it.
    pub async fn run(self) {
        info!(
            primary_secs = self.primary.as_secs(),
            secondary_secs = self.secondary.as_secs(),
            "Sweep scheduler started"
        );

        let mut primary = tokio::time::interval(self.primary);
        let mut secondary = tokio::time::interval(self.secondary);
        primary.set_missed_tick_behavior(MissedTickBehavior::Skip);
        secondary.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = primary.tick() => {
                    self.run_once(SweepKind::ExpiredPeriods).await;
                }
                _ = secondary.tick() => {
                    self.run_once(SweepKind::StalePastDue).await;
                }
            }
        }
    }

    /// Run one sweep now unless another is in progress
    pub async fn run_once(&self, kind: SweepKind) -> Option<SweepReport> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!(sweep = kind.as_str(), "Previous sweep still running, skipping tick");
            return None;
        };

        let now = Utc::now();
        let result = match kind {
            SweepKind::ExpiredPeriods => self.service.sweep_expired(now).await,
            SweepKind::StalePastDue => self.service.sweep_stale_past_due(now).await,
        };
        match result {
            Ok(report) => Some(report),
            Err(e) => {
                error!(sweep = kind.as_str(), error = %e, "Sweep query failed");
                None
            }
        }
    }
}
