//! Reconciliation sweeps
//!
//! Catch what webhooks missed: paid subscriptions whose period ended without
//! a renewal, and past-due subscriptions that stayed past due longer than the
//! grace window. Selection is a pure function over a snapshot; each selected
//! record is then re-evaluated from fresh state inside a compare-and-swap
//! write, so a renewal that lands mid-sweep wins.

use chrono::{DateTime, Duration, Utc};
use critiq_types::{CancellationReason, Subscription, SubscriptionId, SubscriptionStatus, UserId};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::error::BillingError;
use crate::lifecycle::Mutation;
use crate::machine;
use crate::service::BillingService;

/// Which sweep is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    ExpiredPeriods,
    StalePastDue,
}

impl SweepKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExpiredPeriods => "expired_periods",
            Self::StalePastDue => "stale_past_due",
        }
    }
}

/// A record selected for downgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepAction {
    pub subscription_id: SubscriptionId,
    pub user_id: UserId,
    pub reason: CancellationReason,
}

/// Tally for one sweep run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub downgraded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Select current records whose period has ended.
///
/// Free-tier records never expire; their period end is far in the future,
/// and anything without a gateway subscription is skipped regardless.
pub fn select_expired(now: DateTime<Utc>, snapshot: &[Subscription]) -> Vec<SweepAction> {
    snapshot
        .iter()
        .filter(|sub| sub.is_current() && sub.is_external() && sub.period_elapsed(now))
        .map(|sub| SweepAction {
            subscription_id: sub.id,
            user_id: sub.user_id,
            reason: CancellationReason::PeriodExpired,
        })
        .collect()
}

/// Select past-due records whose failure run is older than `grace`
pub fn select_stale_past_due(
    now: DateTime<Utc>,
    grace: Duration,
    snapshot: &[Subscription],
) -> Vec<SweepAction> {
    snapshot
        .iter()
        .filter(|sub| sub.status == SubscriptionStatus::PastDue)
        .filter(|sub| {
            sub.metadata
                .first_past_due_at
                .is_some_and(|since| since + grace < now)
        })
        .map(|sub| SweepAction {
            subscription_id: sub.id,
            user_id: sub.user_id,
            reason: CancellationReason::PastDueGraceExceeded,
        })
        .collect()
}

impl BillingService {
    /// Downgrade paid subscriptions whose period ended without renewal
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let snapshot = self
            .stores
            .subscriptions
            .list_current_ending_before(now, self.config.sweep_batch_size)
            .await?;
        let actions = select_expired(now, &snapshot);
        Ok(self
            .apply_sweep(SweepKind::ExpiredPeriods, snapshot.len(), actions, now)
            .await)
    }

    /// Downgrade subscriptions past due longer than the grace window
    #[instrument(skip(self))]
    pub async fn sweep_stale_past_due(&self, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let grace = self.config.past_due_grace;
        let snapshot = self
            .stores
            .subscriptions
            .list_past_due_since(now - grace, self.config.sweep_batch_size)
            .await?;
        let actions = select_stale_past_due(now, grace, &snapshot);
        Ok(self
            .apply_sweep(SweepKind::StalePastDue, snapshot.len(), actions, now)
            .await)
    }

    async fn apply_sweep(
        &self,
        kind: SweepKind,
        examined: usize,
        actions: Vec<SweepAction>,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let mut report = SweepReport {
            examined,
            ..SweepReport::default()
        };
        if examined as i64 >= self.config.sweep_batch_size {
            warn!(sweep = kind.as_str(), "Sweep batch full, remaining records wait for the next run");
        }

        for action in actions {
            let label = match self.apply_action(kind, &action, now).await {
                Ok(true) => {
                    report.downgraded += 1;
                    "downgraded"
                }
                Ok(false) => {
                    report.skipped += 1;
                    "skipped"
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        sweep = kind.as_str(),
                        subscription_id = %action.subscription_id,
                        user_id = %action.user_id,
                        error = %e,
                        "Sweep item failed"
                    );
                    "failed"
                }
            };
            metrics::counter!(
                "billing_sweep_items_total",
                "sweep" => kind.as_str(),
                "result" => label
            )
            .increment(1);
        }

        info!(
            sweep = kind.as_str(),
            examined = report.examined,
            downgraded = report.downgraded,
            skipped = report.skipped,
            failed = report.failed,
            "Sweep finished"
        );
        report
    }

    /// Re-check one record and downgrade it if still due. `Ok(false)` means
    /// the record no longer qualified.
    async fn apply_action(
        &self,
        kind: SweepKind,
        action: &SweepAction,
        now: DateTime<Utc>,
    ) -> Result<bool, BillingError> {
        let grace = self.config.past_due_grace;
        let mutation = self
            .mutate(action.subscription_id, |sub| {
                Ok(match kind {
                    SweepKind::ExpiredPeriods => machine::on_period_expired(sub, now),
                    SweepKind::StalePastDue => machine::on_grace_check(sub, now, grace),
                })
            })
            .await?;

        match mutation {
            closed @ Mutation::Closed { .. } => {
                self.complete_downgrade(closed).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
