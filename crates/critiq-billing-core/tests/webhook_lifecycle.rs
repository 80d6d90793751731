//! Webhook-driven lifecycle scenarios against in-memory stores

mod common;

use chrono::{Duration, Utc};
use common::{checkout_subscription, event, gateway_view, payment_failed, payment_succeeded, Harness};
use critiq_billing_core::period::{add_period, Cadence};
use critiq_billing_core::{
    BillingError, Channel, DispatchOutcome, GatewayEvent, TemplateKind, WebhookVerifier,
};
use critiq_types::{
    BillingInterval, CancellationReason, CustomerId, ExternalSubscriptionId, PriceId,
    SubscriptionStatus,
};
use serde_json::json;

fn checkout_event(id: &str, h: &Harness, user: critiq_types::UserId, external_id: &str) -> critiq_billing_core::WebhookEvent {
    event(
        id,
        GatewayEvent::CheckoutCompleted {
            session_id: format!("cs_{id}"),
            customer_id: Some(CustomerId::new("cus_checkout")),
            subscription_id: Some(ExternalSubscriptionId::new(external_id)),
            user_id: Some(user),
            plan_id: Some(h.standard.id),
        },
    )
}

#[tokio::test]
async fn test_checkout_with_trial_replaces_free_tier() {
    let mut h = Harness::new();
    let user = h.user();
    let free = h.service.bootstrap_free_tier(user).await.unwrap();
    assert_eq!(h.drain_notifications(), vec![TemplateKind::FreeTierStarted]);

    let trial_end = Utc::now() + Duration::days(7);
    h.gateway
        .put_subscription(checkout_subscription("sub_trial", user, &h.standard, Some(trial_end)));

    let outcome = h
        .service
        .dispatch(&checkout_event("evt_checkout", &h, user, "sub_trial"))
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Created { .. }));

    let current = h.current(user).await.unwrap();
    assert_eq!(current.status, SubscriptionStatus::Trialing);
    assert_eq!(current.plan_id, h.standard.id);
    assert_eq!(
        current.current_period_end,
        add_period(trial_end, Cadence::new(BillingInterval::Month, 1)).unwrap()
    );
    assert_eq!(current.metadata.checkout_session_id.as_deref(), Some("cs_evt_checkout"));

    let old_free = h.reload(free.id).await;
    assert_eq!(old_free.status, SubscriptionStatus::Canceled);
    assert_eq!(old_free.metadata.cancellation_reason, Some(CancellationReason::Replaced));
    let messages: Vec<_> = h.drain().into_iter().map(|m| (m.channel, m.template)).collect();
    assert_eq!(
        messages,
        vec![
            (Channel::Notification, TemplateKind::TrialStarted),
            (Channel::Email, TemplateKind::TrialStarted),
        ]
    );

    // Customer handle learned from the gateway
    let account = h.service.stores().accounts.find_by_id(user).await.unwrap().unwrap();
    assert_eq!(account.customer_id, Some(CustomerId::new("cus_checkout")));
}

#[tokio::test]
async fn test_duplicate_checkout_deliveries_create_one_record() {
    let mut h = Harness::new();
    let user = h.user();
    let gateway_sub = checkout_subscription("sub_dup", user, &h.premium, None);
    h.gateway.put_subscription(gateway_sub.clone());

    let first = h
        .service
        .dispatch(&checkout_event("evt_1", &h, user, "sub_dup"))
        .await
        .unwrap();
    let replay = h
        .service
        .dispatch(&checkout_event("evt_1", &h, user, "sub_dup"))
        .await
        .unwrap();
    let created = h
        .service
        .dispatch(&event("evt_2", GatewayEvent::SubscriptionCreated(gateway_sub)))
        .await
        .unwrap();

    assert!(matches!(first, DispatchOutcome::Created { .. }));
    assert!(matches!(replay, DispatchOutcome::Unchanged { .. }));
    assert!(matches!(created, DispatchOutcome::Unchanged { .. }));

    let paid: Vec<_> = h
        .history(user)
        .await
        .into_iter()
        .filter(|s| s.external_subscription_id.is_some())
        .collect();
    assert_eq!(paid.len(), 1);
    assert_eq!(paid[0].status, SubscriptionStatus::Active);
    assert_eq!(h.drain_notifications(), vec![TemplateKind::SubscriptionActivated]);
}

#[tokio::test]
async fn test_update_before_create_adopts_subscription() {
    let h = Harness::new();
    let user = h.user();
    let gateway_sub = checkout_subscription("sub_early", user, &h.premium, None);

    let outcome = h
        .service
        .dispatch(&event("evt_upd", GatewayEvent::SubscriptionUpdated(gateway_sub)))
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Created { .. }));
    assert_eq!(h.current(user).await.unwrap().plan_id, h.premium.id);
}

#[tokio::test]
async fn test_repeated_payment_failures_downgrade_to_free() {
    let mut h = Harness::new();
    let user = h.user();
    let paid = h
        .paid(user, &h.premium, SubscriptionStatus::Active, Utc::now() + Duration::days(20))
        .await;

    h.service.dispatch(&payment_failed("evt_f1", &paid)).await.unwrap();
    let after_one = h.reload(paid.id).await;
    assert_eq!(after_one.status, SubscriptionStatus::PastDue);
    assert_eq!(after_one.metadata.payment_failure_count, 1);
    let first_past_due = after_one.metadata.first_past_due_at;
    assert!(first_past_due.is_some());

    h.service.dispatch(&payment_failed("evt_f2", &paid)).await.unwrap();
    let after_two = h.reload(paid.id).await;
    assert_eq!(after_two.metadata.payment_failure_count, 2);
    assert_eq!(after_two.metadata.first_past_due_at, first_past_due);

    let outcome = h.service.dispatch(&payment_failed("evt_f3", &paid)).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Downgraded { .. }));

    let closed = h.reload(paid.id).await;
    assert_eq!(closed.status, SubscriptionStatus::Canceled);
    assert_eq!(closed.metadata.cancellation_reason, Some(CancellationReason::PaymentFailed));
    assert_eq!(closed.metadata.payment_failure_count, 3);
    assert!(closed.canceled_at.is_some());

    let free = h.current(user).await.unwrap();
    assert_eq!(free.plan_id, h.free.id);
    assert_eq!(free.status, SubscriptionStatus::Active);
    assert!(free.external_subscription_id.is_none());
    assert_eq!(free.metadata.downgrade_reason, Some(CancellationReason::PaymentFailed));
    assert_eq!(free.metadata.original_plan_id, Some(h.premium.id));
    assert_eq!(free.metadata.downgraded_from, Some(paid.id));
    assert_eq!(free.metadata.payment_failure_count, 0);

    assert_eq!(h.gateway.call_count("cancel_subscription"), 1);
    assert_eq!(
        h.drain_notifications(),
        vec![
            TemplateKind::PastDue,
            TemplateKind::SubscriptionCanceled,
            TemplateKind::DowngradedToFree
        ]
    );
}

#[tokio::test]
async fn test_redelivered_failure_applies_once() {
    let mut h = Harness::new();
    let user = h.user();
    let paid = h
        .paid(user, &h.premium, SubscriptionStatus::Active, Utc::now() + Duration::days(20))
        .await;

    let first = h.service.dispatch(&payment_failed("evt_same", &paid)).await.unwrap();
    let second = h.service.dispatch(&payment_failed("evt_same", &paid)).await.unwrap();

    assert!(matches!(first, DispatchOutcome::Updated { .. }));
    assert_eq!(
        second,
        DispatchOutcome::Unchanged {
            reason: "duplicate_event".to_string()
        }
    );
    assert_eq!(h.reload(paid.id).await.metadata.payment_failure_count, 1);
    assert_eq!(h.drain_notifications(), vec![TemplateKind::PastDue]);
}

#[tokio::test]
async fn test_payment_success_recovers_past_due() {
    let mut h = Harness::new();
    let user = h.user();
    let paid = h
        .paid(user, &h.premium, SubscriptionStatus::Active, Utc::now() + Duration::days(20))
        .await;

    h.service.dispatch(&payment_failed("evt_f1", &paid)).await.unwrap();
    h.service.dispatch(&payment_failed("evt_f2", &paid)).await.unwrap();
    h.service
        .dispatch(&payment_succeeded("evt_ok", &paid, 9900))
        .await
        .unwrap();

    let recovered = h.reload(paid.id).await;
    assert_eq!(recovered.status, SubscriptionStatus::Active);
    assert_eq!(recovered.metadata.payment_failure_count, 0);
    assert!(recovered.metadata.first_past_due_at.is_none());
    assert_eq!(
        h.drain_notifications(),
        vec![TemplateKind::PastDue, TemplateKind::PaymentRecovered]
    );
}

#[tokio::test]
async fn test_failure_after_recovery_starts_a_new_count() {
    let h = Harness::new();
    let user = h.user();
    let paid = h
        .paid(user, &h.premium, SubscriptionStatus::Active, Utc::now() + Duration::days(20))
        .await;

    h.service.dispatch(&payment_failed("evt_f1", &paid)).await.unwrap();
    h.service.dispatch(&payment_failed("evt_f2", &paid)).await.unwrap();
    h.service
        .dispatch(&payment_succeeded("evt_ok", &paid, 9900))
        .await
        .unwrap();
    let outcome = h.service.dispatch(&payment_failed("evt_f3", &paid)).await.unwrap();

    // Three failures in total, but never three in a row
    assert!(matches!(outcome, DispatchOutcome::Updated { .. }));
    let record = h.reload(paid.id).await;
    assert_eq!(record.status, SubscriptionStatus::PastDue);
    assert_eq!(record.metadata.payment_failure_count, 1);
    assert_eq!(h.current(user).await.unwrap().id, paid.id);
    assert_eq!(h.gateway.call_count("cancel_subscription"), 0);
}

#[tokio::test]
async fn test_second_gateway_subscription_cancels_the_one_it_replaces() {
    let h = Harness::new();
    let user = h.user();
    let first = h
        .paid(user, &h.premium, SubscriptionStatus::Active, Utc::now() + Duration::days(20))
        .await;
    let second = checkout_subscription("sub_second", user, &h.standard, None);
    h.gateway.put_subscription(second.clone());

    let outcome = h
        .service
        .dispatch(&event("evt_second", GatewayEvent::SubscriptionCreated(second)))
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Created { .. }));

    let current = h.current(user).await.unwrap();
    assert_eq!(current.external_subscription_id, Some(ExternalSubscriptionId::new("sub_second")));
    assert_eq!(current.plan_id, h.standard.id);

    let retired = h.reload(first.id).await;
    assert_eq!(retired.status, SubscriptionStatus::Canceled);
    assert_eq!(retired.metadata.cancellation_reason, Some(CancellationReason::Replaced));

    // The replaced one no longer bills at the gateway
    let first_external = first.external_subscription_id.clone().unwrap();
    assert_eq!(h.gateway.subscription(&first_external).unwrap().status, "canceled");
    assert_eq!(h.gateway.call_count("cancel_subscription"), 1);
}

#[tokio::test]
async fn test_trial_invoice_of_zero_keeps_trialing() {
    let h = Harness::new();
    let user = h.user();
    let trial = h
        .paid(user, &h.standard, SubscriptionStatus::Trialing, Utc::now() + Duration::days(37))
        .await;

    h.service
        .dispatch(&payment_succeeded("evt_trial_invoice", &trial, 0))
        .await
        .unwrap();
    assert_eq!(h.reload(trial.id).await.status, SubscriptionStatus::Trialing);

    h.service
        .dispatch(&payment_succeeded("evt_first_charge", &trial, 4900))
        .await
        .unwrap();
    assert_eq!(h.reload(trial.id).await.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_renewal_invoice_rolls_period_forward() {
    let mut h = Harness::new();
    let user = h.user();
    let old_end = Utc::now() + Duration::hours(1);
    let paid = h
        .paid(user, &h.premium, SubscriptionStatus::Active, old_end)
        .await;
    let new_end = old_end + Duration::days(30);

    h.service
        .dispatch(&event(
            "evt_renew",
            GatewayEvent::PaymentSucceeded {
                invoice_id: "in_renew".to_string(),
                subscription_id: paid.external_subscription_id.clone(),
                amount_paid: 9900,
                period: Some((old_end, new_end)),
            },
        ))
        .await
        .unwrap();

    let renewed = h.reload(paid.id).await;
    assert_eq!(renewed.current_period_start, old_end);
    assert_eq!(renewed.current_period_end, new_end);
    assert_eq!(h.drain_notifications(), vec![TemplateKind::SubscriptionRenewed]);
}

#[tokio::test]
async fn test_price_change_migrates_plan() {
    let mut h = Harness::new();
    let user = h.user();
    let paid = h
        .paid(user, &h.premium, SubscriptionStatus::Active, Utc::now() + Duration::days(20))
        .await;

    let mut update = gateway_view(&paid, "active");
    update.price_id = Some(PriceId::new("price_standard"));
    h.service
        .dispatch(&event("evt_price", GatewayEvent::SubscriptionUpdated(update)))
        .await
        .unwrap();

    let migrated = h.reload(paid.id).await;
    assert_eq!(migrated.plan_id, h.standard.id);
    assert_eq!(migrated.external_price_id, Some(PriceId::new("price_standard")));
    assert_eq!(h.drain_notifications(), vec![TemplateKind::PlanChanged]);

    // Catalog plans are never edited in place
    let premium = h.service.catalog().get_any(h.premium.id).await.unwrap();
    assert_eq!(premium, h.premium);
}

#[tokio::test]
async fn test_terminal_record_ignores_late_update() {
    let h = Harness::new();
    let user = h.user();
    let ended = h
        .paid(user, &h.premium, SubscriptionStatus::Canceled, Utc::now() - Duration::days(1))
        .await;

    let outcome = h
        .service
        .dispatch(&event(
            "evt_late",
            GatewayEvent::SubscriptionUpdated(gateway_view(&ended, "active")),
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Unchanged {
            reason: "terminal".to_string()
        }
    );
    assert_eq!(h.reload(ended.id).await.status, SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn test_gateway_deletion_downgrades_with_reason() {
    let h = Harness::new();
    let scheduled_user = h.user();
    let other_user = h.user();

    let mut scheduled = h
        .paid(scheduled_user, &h.premium, SubscriptionStatus::Active, Utc::now())
        .await;
    scheduled.cancel_at_period_end = true;
    let scheduled = h.service.stores().subscriptions.update(&scheduled).await.unwrap();
    let plain = h
        .paid(other_user, &h.premium, SubscriptionStatus::Active, Utc::now())
        .await;

    for (id, sub) in [("evt_del_a", &scheduled), ("evt_del_b", &plain)] {
        let outcome = h
            .service
            .dispatch(&event(id, GatewayEvent::SubscriptionDeleted(gateway_view(sub, "canceled"))))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Downgraded { .. }));
    }

    assert_eq!(
        h.reload(scheduled.id).await.metadata.cancellation_reason,
        Some(CancellationReason::UserRequested)
    );
    assert_eq!(
        h.reload(plain.id).await.metadata.cancellation_reason,
        Some(CancellationReason::GatewayCanceled)
    );
    // The gateway already ended these; no cancel call back to it
    assert_eq!(h.gateway.call_count("cancel_subscription"), 0);
    assert_eq!(h.current(other_user).await.unwrap().plan_id, h.free.id);
}

#[tokio::test]
async fn test_trial_will_end_notifies_once() {
    let mut h = Harness::new();
    let user = h.user();
    let trial = h
        .paid(user, &h.standard, SubscriptionStatus::Trialing, Utc::now() + Duration::days(3))
        .await;
    let view = gateway_view(&trial, "trialing");

    h.service
        .dispatch(&event("evt_tw1", GatewayEvent::TrialWillEnd(view.clone())))
        .await
        .unwrap();
    h.service
        .dispatch(&event("evt_tw2", GatewayEvent::TrialWillEnd(view)))
        .await
        .unwrap();

    let messages = h.drain();
    assert_eq!(messages.len(), 2, "one notification and one email");
    assert!(messages.iter().all(|m| m.template == TemplateKind::TrialEnding));
    assert!(h.reload(trial.id).await.metadata.trial_ending_notified_at.is_some());
}

#[tokio::test]
async fn test_event_for_unknown_subscription_is_acknowledged() {
    let h = Harness::new();
    let outcome = h
        .service
        .dispatch(&event(
            "evt_orphan",
            GatewayEvent::PaymentFailed {
                invoice_id: "in_x".to_string(),
                subscription_id: Some(ExternalSubscriptionId::new("sub_unknown")),
                attempt_count: 1,
            },
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Unchanged { .. }));
}

#[tokio::test]
async fn test_signed_delivery_end_to_end() {
    let h = Harness::new();
    let user = h.user();
    let paid = h
        .paid(user, &h.premium, SubscriptionStatus::Active, Utc::now() + Duration::days(20))
        .await;

    let payload = json!({
        "id": "evt_signed",
        "type": "invoice.payment_failed",
        "created": Utc::now().timestamp(),
        "data": { "object": {
            "id": "in_signed",
            "subscription": paid.external_subscription_id.as_ref().unwrap().as_str(),
            "attempt_count": 1
        }}
    })
    .to_string();

    let forged = h.service.handle_webhook(payload.as_bytes(), "t=1,v1=00").await;
    assert!(matches!(forged, Err(BillingError::InvalidSignature(_))));
    assert_eq!(h.reload(paid.id).await.status, SubscriptionStatus::Active);

    let header = WebhookVerifier::new(common::WEBHOOK_SECRET, 300)
        .signature_header(payload.as_bytes(), Utc::now())
        .unwrap();
    h.service
        .handle_webhook(payload.as_bytes(), &header)
        .await
        .unwrap();
    assert_eq!(h.reload(paid.id).await.status, SubscriptionStatus::PastDue);
}
