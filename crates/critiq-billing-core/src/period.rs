//! Billing period arithmetic
//!
//! Pure functions, no I/O. Month and year intervals are calendar arithmetic:
//! the month field advances and the day of month is clamped to the last day
//! of a shorter target month (Jan 31 + 1 month = Feb 28, or Feb 29 in a leap
//! year). Day and week intervals add fixed durations.

use chrono::{DateTime, Duration, Months, Utc};
use critiq_types::{BillingInterval, Plan};

/// Billing cadence: interval unit and count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub interval: BillingInterval,
    pub count: u32,
}

impl Cadence {
    pub fn new(interval: BillingInterval, count: u32) -> Self {
        Self {
            interval,
            count: count.max(1),
        }
    }
}

impl From<&Plan> for Cadence {
    fn from(plan: &Plan) -> Self {
        Self::new(plan.billing_interval, plan.billing_interval_count)
    }
}

/// Advance `start` by one billing period.
///
/// Returns `None` only when the result is outside the representable range.
pub fn add_period(start: DateTime<Utc>, cadence: Cadence) -> Option<DateTime<Utc>> {
    let count = cadence.count.max(1);
    match cadence.interval {
        BillingInterval::Day => start.checked_add_signed(Duration::days(i64::from(count))),
        BillingInterval::Week => start.checked_add_signed(Duration::weeks(i64::from(count))),
        BillingInterval::Month => start.checked_add_months(Months::new(count)),
        BillingInterval::Year => start.checked_add_months(Months::new(count.checked_mul(12)?)),
    }
}

/// Authoritative end of the current billing period.
///
/// Without a trial the gateway-reported end is used as is. With a trial the
/// first paid period starts at `trial_end`, so the end is `trial_end` plus
/// one calendar period; the gateway reports the trial end itself right after
/// checkout, which is not the boundary entitlement checks should use.
pub fn authoritative_period_end(
    trial_end: Option<DateTime<Utc>>,
    cadence: Cadence,
    gateway_period_end: DateTime<Utc>,
) -> DateTime<Utc> {
    match trial_end {
        Some(trial_end) => add_period(trial_end, cadence).unwrap_or(gateway_period_end),
        None => gateway_period_end,
    }
}

/// Period bounds for a subscription as reported by the gateway.
///
/// `in_trial` selects the trial rule; the plan must also offer a trial for it
/// to apply. The end is never earlier than the start.
pub fn resolve_period(
    plan: &Plan,
    in_trial: bool,
    trial_end: Option<DateTime<Utc>>,
    gateway_start: DateTime<Utc>,
    gateway_end: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let trial_end = trial_end.filter(|_| in_trial && plan.has_trial());
    let end = authoritative_period_end(trial_end, Cadence::from(plan), gateway_end);
    (gateway_start, end.max(gateway_start))
}
