//! Subscription state machine
//!
//! Pure decision functions. Each takes the stored record plus the triggering
//! input and returns an [`Outcome`]; nothing here touches storage or the
//! gateway. The lifecycle layer runs these inside its compare-and-swap loop,
//! so a decision is re-made from fresh state whenever a write loses a race.

use chrono::{DateTime, Utc};
use critiq_types::{
    free_tier_period_end, CancellationReason, Plan, Subscription, SubscriptionId,
    SubscriptionMetadata, SubscriptionStatus, UserId,
};
use serde_json::json;

use crate::error::BillingError;
use crate::gateway::GatewaySubscription;
use crate::notify::{Notice, TemplateKind};
use crate::period::resolve_period;

/// Result of evaluating one input against a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing to write; the label says why
    Unchanged(&'static str),
    /// Write `next`, then publish `notice` if any
    Update {
        next: Subscription,
        notice: Option<Notice>,
    },
    /// End this record and move the user to the free tier. `next` carries any
    /// bookkeeping (event ledger, failure counters) to persist with the
    /// cancellation.
    Downgrade {
        reason: CancellationReason,
        next: Subscription,
    },
}

impl Outcome {
    fn update(next: Subscription, notice: Option<Notice>) -> Self {
        Self::Update { next, notice }
    }
}

/// Whether `after` differs from `before` in anything but bookkeeping
fn differs(before: &Subscription, after: &Subscription) -> bool {
    let mut normalized = before.clone();
    normalized
        .metadata
        .applied_events
        .clone_from(&after.metadata.applied_events);
    normalized.updated_at = after.updated_at;
    normalized != *after
}

/// Move to `next_status`, enforcing the transition table
pub fn transition(
    sub: &mut Subscription,
    next_status: SubscriptionStatus,
    now: DateTime<Utc>,
) -> Result<(), BillingError> {
    if !sub.status.can_transition_to(next_status) {
        return Err(BillingError::Validation(format!(
            "illegal transition {} -> {}",
            sub.status, next_status
        )));
    }
    sub.status = next_status;
    if next_status.is_terminal() {
        sub.canceled_at.get_or_insert(now);
        sub.cancel_at_period_end = false;
    }
    sub.updated_at = now;
    Ok(())
}

/// Terminal status a downgrade leaves behind
pub fn terminal_status_for(reason: CancellationReason) -> SubscriptionStatus {
    match reason {
        CancellationReason::Unpaid => SubscriptionStatus::Unpaid,
        CancellationReason::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        _ => SubscriptionStatus::Canceled,
    }
}

/// Apply the terminal half of a downgrade to `sub`
pub fn close_record(
    sub: &mut Subscription,
    reason: CancellationReason,
    now: DateTime<Utc>,
) -> Result<(), BillingError> {
    transition(sub, terminal_status_for(reason), now)?;
    sub.metadata.cancellation_reason = Some(reason);
    Ok(())
}

/// Retire the current record because a newer one supersedes it
pub fn on_replaced(sub: &Subscription, now: DateTime<Utc>) -> Result<Outcome, BillingError> {
    if sub.status.is_terminal() {
        return Ok(Outcome::Unchanged("terminal"));
    }
    let mut next = sub.clone();
    close_record(&mut next, CancellationReason::Replaced, now)?;
    Ok(Outcome::update(next, None))
}

/// Charge attempt failed
pub fn on_payment_failed(
    sub: &Subscription,
    event_id: &str,
    now: DateTime<Utc>,
    threshold: u32,
) -> Result<Outcome, BillingError> {
    if sub.metadata.has_applied(event_id) {
        return Ok(Outcome::Unchanged("duplicate_event"));
    }
    if sub.status.is_terminal() {
        return Ok(Outcome::Unchanged("terminal"));
    }

    let mut next = sub.clone();
    next.metadata.record_event(event_id);
    next.metadata.payment_failure_count += 1;
    next.metadata.first_past_due_at.get_or_insert(now);
    next.metadata.last_payment_failure_at = Some(now);

    if next.metadata.payment_failure_count >= threshold {
        return Ok(Outcome::Downgrade {
            reason: CancellationReason::PaymentFailed,
            next,
        });
    }

    let notice = if next.status == SubscriptionStatus::PastDue {
        None
    } else {
        transition(&mut next, SubscriptionStatus::PastDue, now)?;
        Some(
            Notice::new(TemplateKind::PastDue)
                .with_data(json!({ "failure_count": next.metadata.payment_failure_count })),
        )
    };
    Ok(Outcome::update(next, notice))
}

/// Charge attempt succeeded.
///
/// `amount_paid` of zero is the trial's opening invoice and does not end the
/// trial. `period` is the invoiced period, used to roll a renewal forward.
pub fn on_payment_succeeded(
    sub: &Subscription,
    event_id: &str,
    amount_paid: i64,
    period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    now: DateTime<Utc>,
) -> Result<Outcome, BillingError> {
    if sub.metadata.has_applied(event_id) {
        return Ok(Outcome::Unchanged("duplicate_event"));
    }
    if sub.status.is_terminal() {
        return Ok(Outcome::Unchanged("terminal"));
    }

    let mut next = sub.clone();
    next.metadata.record_event(event_id);
    let mut notice = None;

    match sub.status {
        SubscriptionStatus::PastDue => {
            transition(&mut next, SubscriptionStatus::Active, now)?;
            next.metadata.reset_payment_failures();
            notice = Some(Notice::new(TemplateKind::PaymentRecovered));
        }
        SubscriptionStatus::Trialing if amount_paid > 0 => {
            transition(&mut next, SubscriptionStatus::Active, now)?;
            next.metadata.reset_payment_failures();
            notice = Some(Notice::new(TemplateKind::SubscriptionActivated));
        }
        _ => next.metadata.reset_payment_failures(),
    }

    if let Some((start, end)) = period {
        if next.status != SubscriptionStatus::Trialing && end > next.current_period_end {
            next.current_period_start = start;
            next.current_period_end = end.max(start);
            notice.get_or_insert_with(|| {
                Notice::new(TemplateKind::SubscriptionRenewed)
                    .with_data(json!({ "current_period_end": end }))
            });
        }
    }

    if !differs(sub, &next) {
        return Ok(Outcome::Unchanged("already_reflected"));
    }
    Ok(Outcome::update(next, notice))
}

/// Gateway reported the subscription's new state.
///
/// `plan` is the plan the record should be on afterwards: the current plan,
/// or the catalog plan for the gateway's new price when the price changed.
pub fn on_gateway_update(
    sub: &Subscription,
    gateway: &GatewaySubscription,
    plan: &Plan,
    event_id: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, BillingError> {
    if sub.metadata.has_applied(event_id) {
        return Ok(Outcome::Unchanged("duplicate_event"));
    }
    if sub.status.is_terminal() {
        return Ok(Outcome::Unchanged("terminal"));
    }
    let Some(status) = gateway.local_status() else {
        return Ok(Outcome::Unchanged("unmapped_status"));
    };

    let mut next = sub.clone();
    next.metadata.record_event(event_id);

    if status.is_terminal() {
        let reason = match status {
            SubscriptionStatus::Unpaid => CancellationReason::Unpaid,
            SubscriptionStatus::IncompleteExpired => CancellationReason::IncompleteExpired,
            _ if sub.cancel_at_period_end => CancellationReason::UserRequested,
            _ => CancellationReason::GatewayCanceled,
        };
        return Ok(Outcome::Downgrade { reason, next });
    }

    let mut notice = None;
    if status != sub.status {
        if !sub.status.can_transition_to(status) {
            return Ok(Outcome::Unchanged("illegal_transition"));
        }
        transition(&mut next, status, now)?;
        notice = match (sub.status, status) {
            (SubscriptionStatus::PastDue, SubscriptionStatus::Active) => {
                next.metadata.reset_payment_failures();
                Some(Notice::new(TemplateKind::PaymentRecovered))
            }
            (_, SubscriptionStatus::Active) => Some(Notice::new(TemplateKind::SubscriptionActivated)),
            (_, SubscriptionStatus::PastDue) => {
                next.metadata.first_past_due_at.get_or_insert(now);
                Some(Notice::new(TemplateKind::PastDue))
            }
            _ => None,
        };
    }

    if plan.id != sub.plan_id {
        next.plan_id = plan.id;
        next.external_price_id.clone_from(&gateway.price_id);
        notice.get_or_insert_with(|| {
            Notice::new(TemplateKind::PlanChanged).with_data(json!({
                "from_plan_id": sub.plan_id,
                "to_plan_id": plan.id,
            }))
        });
    }

    let (start, end) = resolve_period(
        plan,
        status == SubscriptionStatus::Trialing,
        gateway.trial_end,
        gateway.current_period_start,
        gateway.current_period_end,
    );
    let renewed = end > sub.current_period_end && status != SubscriptionStatus::Trialing;
    next.current_period_start = start;
    next.current_period_end = end;
    next.trial_start = gateway.trial_start.or(sub.trial_start);
    next.trial_end = gateway.trial_end.or(sub.trial_end);
    if renewed {
        notice.get_or_insert_with(|| {
            Notice::new(TemplateKind::SubscriptionRenewed)
                .with_data(json!({ "current_period_end": end }))
        });
    }

    if gateway.cancel_at_period_end != sub.cancel_at_period_end {
        next.cancel_at_period_end = gateway.cancel_at_period_end;
        notice.get_or_insert_with(|| {
            Notice::new(if gateway.cancel_at_period_end {
                TemplateKind::CancellationScheduled
            } else {
                TemplateKind::CancellationRevoked
            })
        });
    }

    if !differs(sub, &next) {
        return Ok(Outcome::Unchanged("already_reflected"));
    }
    next.updated_at = now;
    Ok(Outcome::update(next, notice))
}

/// Gateway reported the subscription deleted
pub fn on_gateway_deleted(sub: &Subscription, event_id: &str) -> Outcome {
    if sub.status.is_terminal() {
        return Outcome::Unchanged("terminal");
    }
    let reason = if sub.cancel_at_period_end {
        CancellationReason::UserRequested
    } else {
        CancellationReason::GatewayCanceled
    };
    let mut next = sub.clone();
    next.metadata.record_event(event_id);
    Outcome::Downgrade { reason, next }
}

/// Trial ends soon; notify once per subscription
pub fn on_trial_will_end(sub: &Subscription, event_id: &str, now: DateTime<Utc>) -> Outcome {
    if sub.metadata.has_applied(event_id) {
        return Outcome::Unchanged("duplicate_event");
    }
    if sub.status != SubscriptionStatus::Trialing {
        return Outcome::Unchanged("not_trialing");
    }
    if sub.metadata.trial_ending_notified_at.is_some() {
        return Outcome::Unchanged("already_notified");
    }

    let mut next = sub.clone();
    next.metadata.record_event(event_id);
    next.metadata.trial_ending_notified_at = Some(now);
    next.updated_at = now;
    let notice = Notice::new(TemplateKind::TrialEnding).with_data(json!({ "trial_end": sub.trial_end }));
    Outcome::update(next, Some(notice))
}

/// User asked to cancel at the end of the period
pub fn on_cancel_scheduled(sub: &Subscription, now: DateTime<Utc>) -> Outcome {
    if sub.status.is_terminal() {
        return Outcome::Unchanged("terminal");
    }
    if sub.cancel_at_period_end {
        return Outcome::Unchanged("already_scheduled");
    }
    let mut next = sub.clone();
    next.cancel_at_period_end = true;
    next.updated_at = now;
    let notice = Notice::new(TemplateKind::CancellationScheduled)
        .with_data(json!({ "ends_at": sub.current_period_end }));
    Outcome::update(next, Some(notice))
}

/// Reactivation of a scheduled cancellation: clear the flag
pub fn on_cancellation_revoked(
    sub: &Subscription,
    now: DateTime<Utc>,
) -> Result<Outcome, BillingError> {
    if sub.status.is_terminal() {
        return Err(BillingError::NotReactivatable(format!(
            "subscription is {}",
            sub.status
        )));
    }
    if !sub.cancel_at_period_end {
        return Err(BillingError::AlreadyActive);
    }
    let mut next = sub.clone();
    next.cancel_at_period_end = false;
    next.metadata.reactivated_at = Some(now);
    next.metadata.reactivation_count += 1;
    next.updated_at = now;
    Ok(Outcome::update(
        next,
        Some(Notice::new(TemplateKind::SubscriptionReactivated)),
    ))
}

/// Downgrade requested by a caller that already decided on a reason
pub fn on_downgrade_requested(
    sub: &Subscription,
    reason: CancellationReason,
    event_id: Option<&str>,
) -> Outcome {
    if sub.status.is_terminal() {
        return Outcome::Unchanged("terminal");
    }
    let mut next = sub.clone();
    if let Some(event_id) = event_id {
        next.metadata.record_event(event_id);
    }
    Outcome::Downgrade { reason, next }
}

/// Sweep check: period ended without a renewal.
///
/// Re-evaluated from fresh state, so a renewal that landed after the sweep
/// loaded its snapshot turns this into a no-op.
pub fn on_period_expired(sub: &Subscription, now: DateTime<Utc>) -> Outcome {
    if sub.status.is_terminal() {
        return Outcome::Unchanged("terminal");
    }
    if !sub.period_elapsed(now) {
        return Outcome::Unchanged("renewed");
    }
    Outcome::Downgrade {
        reason: CancellationReason::PeriodExpired,
        next: sub.clone(),
    }
}

/// Sweep check: past due longer than the grace window
pub fn on_grace_check(sub: &Subscription, now: DateTime<Utc>, grace: chrono::Duration) -> Outcome {
    if sub.status != SubscriptionStatus::PastDue {
        return Outcome::Unchanged("recovered");
    }
    match sub.metadata.first_past_due_at {
        Some(since) if since + grace < now => Outcome::Downgrade {
            reason: CancellationReason::PastDueGraceExceeded,
            next: sub.clone(),
        },
        Some(_) => Outcome::Unchanged("within_grace"),
        None => Outcome::Unchanged("no_failure_timestamp"),
    }
}

/// New record for a gateway subscription
pub fn new_paid_subscription(
    user_id: UserId,
    plan: &Plan,
    gateway: &GatewaySubscription,
    now: DateTime<Utc>,
) -> Result<(Subscription, Notice), BillingError> {
    let status = match gateway.local_status() {
        Some(status @ (SubscriptionStatus::Trialing | SubscriptionStatus::Active)) => status,
        other => {
            return Err(BillingError::Validation(format!(
                "cannot create a subscription in gateway status {}",
                other.map_or(gateway.status.as_str(), |s| s.as_str())
            )))
        }
    };

    let (start, end) = resolve_period(
        plan,
        status == SubscriptionStatus::Trialing,
        gateway.trial_end,
        gateway.current_period_start,
        gateway.current_period_end,
    );

    let sub = Subscription {
        id: SubscriptionId::new(),
        user_id,
        plan_id: plan.id,
        status,
        current_period_start: start,
        current_period_end: end,
        trial_start: gateway.trial_start,
        trial_end: gateway.trial_end,
        cancel_at_period_end: gateway.cancel_at_period_end,
        canceled_at: None,
        customer_id: Some(gateway.customer_id.clone()),
        external_subscription_id: Some(gateway.id.clone()),
        external_price_id: gateway.price_id.clone().or_else(|| plan.external_price_id.clone()),
        metadata: SubscriptionMetadata::default(),
        version: 0,
        created_at: now,
        updated_at: now,
    };

    let template = if status == SubscriptionStatus::Trialing {
        TemplateKind::TrialStarted
    } else {
        TemplateKind::SubscriptionActivated
    };
    let notice = Notice::new(template).with_data(json!({
        "plan_id": plan.id,
        "plan_name": plan.name,
        "current_period_end": end,
        "trial_end": gateway.trial_end,
    }));
    Ok((sub, notice))
}

/// Where a free-tier record came from
#[derive(Debug, Clone)]
pub struct Provenance {
    pub from: Subscription,
    pub reason: CancellationReason,
}

/// New free-tier record
pub fn new_free_subscription(
    user_id: UserId,
    free_plan: &Plan,
    provenance: Option<&Provenance>,
    now: DateTime<Utc>,
) -> (Subscription, Notice) {
    let mut metadata = SubscriptionMetadata::default();
    let notice = match provenance {
        Some(p) => {
            metadata.downgrade_reason = Some(p.reason);
            metadata.original_plan_id = Some(p.from.plan_id);
            metadata.downgraded_from = Some(p.from.id);
            Notice::new(TemplateKind::DowngradedToFree).with_data(json!({
                "reason": p.reason.as_str(),
                "original_plan_id": p.from.plan_id,
            }))
        }
        None => Notice::new(TemplateKind::FreeTierStarted),
    };

    let sub = Subscription {
        id: SubscriptionId::new(),
        user_id,
        plan_id: free_plan.id,
        status: SubscriptionStatus::Active,
        current_period_start: now,
        current_period_end: free_tier_period_end(),
        trial_start: None,
        trial_end: None,
        cancel_at_period_end: false,
        canceled_at: None,
        customer_id: None,
        external_subscription_id: None,
        external_price_id: None,
        metadata,
        version: 0,
        created_at: now,
        updated_at: now,
    };
    (sub, notice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use critiq_types::{BillingInterval, CustomerId, ExternalSubscriptionId, PlanId, PlanType, PriceId};
    use std::collections::HashMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 31, 9, 0, 0).unwrap()
    }

    fn plan(trial_days: u32) -> Plan {
        Plan {
            id: PlanId::new(),
            name: "Standard".to_string(),
            plan_type: PlanType::Standard,
            price_cents: 4900,
            currency: "usd".to_string(),
            billing_interval: BillingInterval::Month,
            billing_interval_count: 1,
            trial_period_days: trial_days,
            features: vec![],
            max_products: None,
            external_price_id: Some(PriceId::new("price_std")),
            external_product_id: None,
            is_active: true,
            created_at: now(),
        }
    }

    fn gateway_sub(status: &str, trial_end: Option<DateTime<Utc>>) -> GatewaySubscription {
        GatewaySubscription {
            id: ExternalSubscriptionId::new("sub_1"),
            customer_id: CustomerId::new("cus_1"),
            status: status.to_string(),
            price_id: Some(PriceId::new("price_std")),
            current_period_start: now(),
            current_period_end: trial_end.unwrap_or(now() + Duration::days(31)),
            trial_start: trial_end.map(|_| now()),
            trial_end,
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: HashMap::new(),
        }
    }

    fn paid(status: SubscriptionStatus) -> (Plan, Subscription) {
        let plan = plan(0);
        let (mut sub, _) =
            new_paid_subscription(UserId::new(), &plan, &gateway_sub("active", None), now()).unwrap();
        sub.status = status;
        (plan, sub)
    }

    fn expect_update(outcome: Outcome) -> (Subscription, Option<Notice>) {
        match outcome {
            Outcome::Update { next, notice } => (next, notice),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_trial_creation_uses_calendar_period_after_trial() {
        let trial_end = now() + Duration::days(7);
        let (sub, notice) = new_paid_subscription(
            UserId::new(),
            &plan(7),
            &gateway_sub("trialing", Some(trial_end)),
            now(),
        )
        .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.trial_end, Some(trial_end));
        // Feb 7 + 1 month
        assert_eq!(
            sub.current_period_end,
            Utc.with_ymd_and_hms(2025, 3, 7, 9, 0, 0).unwrap()
        );
        assert_eq!(notice.template, TemplateKind::TrialStarted);
    }

    #[test]
    fn test_incomplete_gateway_subscription_not_created() {
        let result = new_paid_subscription(
            UserId::new(),
            &plan(0),
            &gateway_sub("incomplete", None),
            now(),
        );
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[test]
    fn test_failures_reach_threshold() {
        let (_, sub) = paid(SubscriptionStatus::Active);

        let (first, notice) = expect_update(on_payment_failed(&sub, "evt_1", now(), 3).unwrap());
        assert_eq!(first.status, SubscriptionStatus::PastDue);
        assert_eq!(first.metadata.payment_failure_count, 1);
        assert_eq!(first.metadata.first_past_due_at, Some(now()));
        assert_eq!(notice.unwrap().template, TemplateKind::PastDue);

        let later = now() + Duration::days(3);
        let (second, notice) = expect_update(on_payment_failed(&first, "evt_2", later, 3).unwrap());
        assert_eq!(second.metadata.payment_failure_count, 2);
        // First past-due timestamp is kept
        assert_eq!(second.metadata.first_past_due_at, Some(now()));
        assert!(notice.is_none());

        match on_payment_failed(&second, "evt_3", later, 3).unwrap() {
            Outcome::Downgrade { reason, next } => {
                assert_eq!(reason, CancellationReason::PaymentFailed);
                assert_eq!(next.metadata.payment_failure_count, 3);
            }
            other => panic!("expected downgrade, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_failure_event_is_noop() {
        let (_, sub) = paid(SubscriptionStatus::Active);
        let (first, _) = expect_update(on_payment_failed(&sub, "evt_1", now(), 3).unwrap());
        assert_eq!(
            on_payment_failed(&first, "evt_1", now(), 3).unwrap(),
            Outcome::Unchanged("duplicate_event")
        );
    }

    #[test]
    fn test_success_resets_counter() {
        let (_, sub) = paid(SubscriptionStatus::Active);
        let (one, _) = expect_update(on_payment_failed(&sub, "evt_1", now(), 3).unwrap());
        let (two, _) = expect_update(on_payment_failed(&one, "evt_2", now(), 3).unwrap());

        let (recovered, notice) =
            expect_update(on_payment_succeeded(&two, "evt_3", 4900, None, now()).unwrap());
        assert_eq!(recovered.status, SubscriptionStatus::Active);
        assert_eq!(recovered.metadata.payment_failure_count, 0);
        assert!(recovered.metadata.first_past_due_at.is_none());
        assert_eq!(notice.unwrap().template, TemplateKind::PaymentRecovered);
    }

    #[test]
    fn test_zero_amount_invoice_keeps_trial() {
        let (_, sub) = paid(SubscriptionStatus::Trialing);
        assert_eq!(
            on_payment_succeeded(&sub, "evt_trial_invoice", 0, None, now()).unwrap(),
            Outcome::Unchanged("already_reflected")
        );

        let (active, notice) =
            expect_update(on_payment_succeeded(&sub, "evt_first_charge", 4900, None, now()).unwrap());
        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(notice.unwrap().template, TemplateKind::SubscriptionActivated);
    }

    #[test]
    fn test_gateway_update_reflected_is_noop() {
        let (plan, sub) = paid(SubscriptionStatus::Active);
        let gateway = gateway_sub("active", None);
        assert_eq!(
            on_gateway_update(&sub, &gateway, &plan, "evt_9", now()).unwrap(),
            Outcome::Unchanged("already_reflected")
        );
    }

    #[test]
    fn test_gateway_update_cannot_return_to_trial() {
        let (plan, sub) = paid(SubscriptionStatus::Active);
        let gateway = gateway_sub("trialing", Some(now() + Duration::days(7)));
        assert_eq!(
            on_gateway_update(&sub, &gateway, &plan, "evt_9", now()).unwrap(),
            Outcome::Unchanged("illegal_transition")
        );
    }

    #[test]
    fn test_gateway_price_change_migrates_plan() {
        let (_, sub) = paid(SubscriptionStatus::Active);
        let mut premium = plan(0);
        premium.plan_type = PlanType::Premium;
        premium.external_price_id = Some(PriceId::new("price_premium"));
        let mut gateway = gateway_sub("active", None);
        gateway.price_id = Some(PriceId::new("price_premium"));

        let (next, notice) =
            expect_update(on_gateway_update(&sub, &gateway, &premium, "evt_10", now()).unwrap());
        assert_eq!(next.plan_id, premium.id);
        assert_eq!(next.external_price_id, Some(PriceId::new("price_premium")));
        assert_eq!(notice.unwrap().template, TemplateKind::PlanChanged);
    }

    #[test]
    fn test_gateway_terminal_status_requests_downgrade() {
        let (plan, mut sub) = paid(SubscriptionStatus::Active);
        let unpaid = gateway_sub("unpaid", None);
        assert!(matches!(
            on_gateway_update(&sub, &unpaid, &plan, "evt_11", now()).unwrap(),
            Outcome::Downgrade { reason: CancellationReason::Unpaid, .. }
        ));

        sub.cancel_at_period_end = true;
        assert!(matches!(
            on_gateway_deleted(&sub, "evt_12"),
            Outcome::Downgrade { reason: CancellationReason::UserRequested, .. }
        ));
    }

    #[test]
    fn test_trial_will_end_notifies_once() {
        let (_, sub) = paid(SubscriptionStatus::Trialing);
        let (notified, notice) = expect_update(on_trial_will_end(&sub, "evt_a", now()));
        assert_eq!(notice.unwrap().template, TemplateKind::TrialEnding);
        assert_eq!(
            on_trial_will_end(&notified, "evt_b", now()),
            Outcome::Unchanged("already_notified")
        );
    }

    #[test]
    fn test_expiry_is_reevaluated() {
        let (_, mut sub) = paid(SubscriptionStatus::Active);
        sub.current_period_end = now() - Duration::hours(1);
        assert!(matches!(
            on_period_expired(&sub, now()),
            Outcome::Downgrade { reason: CancellationReason::PeriodExpired, .. }
        ));

        sub.current_period_end = now() + Duration::days(30);
        assert_eq!(on_period_expired(&sub, now()), Outcome::Unchanged("renewed"));
    }

    #[test]
    fn test_grace_window() {
        let (_, mut sub) = paid(SubscriptionStatus::PastDue);
        let grace = Duration::days(7);
        sub.metadata.first_past_due_at = Some(now() - Duration::days(6));
        assert_eq!(on_grace_check(&sub, now(), grace), Outcome::Unchanged("within_grace"));

        sub.metadata.first_past_due_at = Some(now() - Duration::days(8));
        assert!(matches!(
            on_grace_check(&sub, now(), grace),
            Outcome::Downgrade { reason: CancellationReason::PastDueGraceExceeded, .. }
        ));
    }

    #[test]
    fn test_close_record_sets_terminal_fields() {
        let (_, mut sub) = paid(SubscriptionStatus::Active);
        sub.cancel_at_period_end = true;
        close_record(&mut sub, CancellationReason::IncompleteExpired, now()).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::IncompleteExpired);
        assert_eq!(sub.canceled_at, Some(now()));
        assert!(!sub.cancel_at_period_end);
        assert_eq!(
            sub.metadata.cancellation_reason,
            Some(CancellationReason::IncompleteExpired)
        );

        // Terminal records cannot be closed twice
        assert!(close_record(&mut sub, CancellationReason::UserRequested, now()).is_err());
    }

    #[test]
    fn test_free_record_links_provenance() {
        let (_, old) = paid(SubscriptionStatus::Canceled);
        let mut free = plan(0);
        free.plan_type = PlanType::Free;
        let provenance = Provenance {
            from: old.clone(),
            reason: CancellationReason::PaymentFailed,
        };

        let (sub, notice) = new_free_subscription(old.user_id, &free, Some(&provenance), now());
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_end, free_tier_period_end());
        assert!(sub.external_subscription_id.is_none() && sub.customer_id.is_none());
        assert_eq!(sub.metadata.downgraded_from, Some(old.id));
        assert_eq!(sub.metadata.original_plan_id, Some(old.plan_id));
        assert_eq!(sub.metadata.payment_failure_count, 0);
        assert_eq!(notice.template, TemplateKind::DowngradedToFree);
    }
}
