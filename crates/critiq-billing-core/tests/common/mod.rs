//! Common test utilities for critiq-billing-core integration tests

pub mod mock_gateway;
pub mod racing_repo;
pub mod recording_notifier;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use critiq_billing_core::{
    BillingConfig, BillingService, Channel, GatewayEvent, GatewaySubscription, OutboundMessage,
    Outbox, OutboxReceiver, TemplateKind, WebhookEvent,
};
use critiq_db::{MemoryRepositories, Stores};
use critiq_types::{
    BillingAccount, BillingInterval, CustomerId, ExternalSubscriptionId, Plan, PlanId, PlanType,
    PriceId, Subscription, SubscriptionId, SubscriptionMetadata, SubscriptionStatus, UserId,
};

#[allow(unused_imports)]
pub use mock_gateway::MockGateway;
#[allow(unused_imports)]
pub use racing_repo::RacingSubscriptions;
#[allow(unused_imports)]
pub use recording_notifier::RecordingNotifier;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Billing service over in-memory stores and a mock gateway
#[allow(dead_code)]
pub struct Harness {
    pub repos: MemoryRepositories,
    pub racing: Arc<RacingSubscriptions>,
    pub gateway: Arc<MockGateway>,
    pub service: Arc<BillingService>,
    pub outbox: OutboxReceiver,
    pub free: Plan,
    /// Monthly, 7-day trial
    pub standard: Plan,
    /// Monthly, no trial
    pub premium: Plan,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig::new("sk_test", WEBHOOK_SECRET))
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let repos = MemoryRepositories::new();
        let free = plan("Free", PlanType::Free, 0, 0, None);
        let standard = plan("Standard", PlanType::Standard, 4900, 7, Some("price_standard"));
        let premium = plan("Premium", PlanType::Premium, 9900, 0, Some("price_premium"));
        for p in [&free, &standard, &premium] {
            repos.plans.put(p.clone());
        }

        let racing = Arc::new(RacingSubscriptions::new(repos.subscriptions.clone()));
        let base = repos.stores();
        let stores = Stores {
            plans: base.plans,
            subscriptions: racing.clone(),
            accounts: base.accounts,
        };

        let gateway = Arc::new(MockGateway::new());
        let (outbox, receiver) = Outbox::channel();
        let service = Arc::new(BillingService::new(stores, gateway.clone(), outbox, config));

        Self {
            repos,
            racing,
            gateway,
            service,
            outbox: receiver,
            free,
            standard,
            premium,
        }
    }

    /// Register a vendor account
    pub fn user(&self) -> UserId {
        let user_id = UserId::new();
        self.repos.accounts.put(BillingAccount {
            user_id,
            email: format!("vendor-{user_id}@example.com"),
            name: Some("Test Vendor".to_string()),
            customer_id: None,
        });
        user_id
    }

    /// Register a vendor account that already has a gateway customer
    pub fn user_with_customer(&self, customer_id: &str) -> UserId {
        let user_id = self.user();
        self.repos.accounts.put(BillingAccount {
            user_id,
            email: format!("vendor-{user_id}@example.com"),
            name: None,
            customer_id: Some(CustomerId::new(customer_id)),
        });
        user_id
    }

    /// Store a paid record and its gateway twin
    pub async fn paid(
        &self,
        user_id: UserId,
        plan: &Plan,
        status: SubscriptionStatus,
        period_end: DateTime<Utc>,
    ) -> Subscription {
        let external_id = format!("sub_{}", SubscriptionId::new().0.simple());
        let now = Utc::now();
        let sub = Subscription {
            id: SubscriptionId::new(),
            user_id,
            plan_id: plan.id,
            status,
            current_period_start: period_end - Duration::days(30),
            current_period_end: period_end,
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            canceled_at: status.is_terminal().then_some(now),
            customer_id: Some(CustomerId::new("cus_existing")),
            external_subscription_id: Some(ExternalSubscriptionId::new(&external_id)),
            external_price_id: plan.external_price_id.clone(),
            metadata: SubscriptionMetadata::default(),
            version: 0,
            created_at: now - Duration::days(30),
            updated_at: now,
        };
        self.gateway.put_subscription(gateway_view(&sub, status.as_str()));
        self.service
            .stores()
            .subscriptions
            .insert(&sub)
            .await
            .expect("insert paid subscription")
    }

    pub async fn current(&self, user_id: UserId) -> Option<Subscription> {
        self.service
            .stores()
            .subscriptions
            .find_current_by_user_id(user_id)
            .await
            .expect("load current subscription")
    }

    pub async fn reload(&self, id: SubscriptionId) -> Subscription {
        self.service
            .stores()
            .subscriptions
            .find_by_id(id)
            .await
            .expect("load subscription")
            .expect("subscription exists")
    }

    pub async fn history(&self, user_id: UserId) -> Vec<Subscription> {
        self.service.list_subscriptions(user_id).await.expect("history")
    }

    /// Messages queued since the last drain
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        self.outbox.drain()
    }

    /// In-app notifications queued since the last drain, by template
    pub fn drain_notifications(&mut self) -> Vec<TemplateKind> {
        self.drain()
            .into_iter()
            .filter(|m| m.channel == Channel::Notification)
            .map(|m| m.template)
            .collect()
    }
}

#[allow(dead_code)]
pub fn plan(
    name: &str,
    plan_type: PlanType,
    price_cents: i64,
    trial_days: u32,
    price_id: Option<&str>,
) -> Plan {
    Plan {
        id: PlanId::new(),
        name: name.to_string(),
        plan_type,
        price_cents,
        currency: "usd".to_string(),
        billing_interval: BillingInterval::Month,
        billing_interval_count: 1,
        trial_period_days: trial_days,
        features: vec!["reviews".to_string()],
        max_products: None,
        external_price_id: price_id.map(PriceId::new),
        external_product_id: None,
        is_active: true,
        created_at: Utc::now(),
    }
}

/// Gateway-side copy of a local record
#[allow(dead_code)]
pub fn gateway_view(sub: &Subscription, status: &str) -> GatewaySubscription {
    GatewaySubscription {
        id: sub
            .external_subscription_id
            .clone()
            .unwrap_or_else(|| ExternalSubscriptionId::new("sub_none")),
        customer_id: sub
            .customer_id
            .clone()
            .unwrap_or_else(|| CustomerId::new("cus_none")),
        status: status.to_string(),
        price_id: sub.external_price_id.clone(),
        current_period_start: sub.current_period_start,
        current_period_end: sub.current_period_end,
        trial_start: sub.trial_start,
        trial_end: sub.trial_end,
        cancel_at_period_end: sub.cancel_at_period_end,
        canceled_at: None,
        metadata: HashMap::from([
            ("user_id".to_string(), sub.user_id.to_string()),
            ("plan_id".to_string(), sub.plan_id.to_string()),
        ]),
    }
}

/// Gateway subscription as created by a checkout
#[allow(dead_code)]
pub fn checkout_subscription(
    external_id: &str,
    user_id: UserId,
    plan: &Plan,
    trial_end: Option<DateTime<Utc>>,
) -> GatewaySubscription {
    let now = Utc::now();
    GatewaySubscription {
        id: ExternalSubscriptionId::new(external_id),
        customer_id: CustomerId::new("cus_checkout"),
        status: if trial_end.is_some() { "trialing" } else { "active" }.to_string(),
        price_id: plan.external_price_id.clone(),
        current_period_start: now,
        current_period_end: trial_end.unwrap_or(now + Duration::days(30)),
        trial_start: trial_end.map(|_| now),
        trial_end,
        cancel_at_period_end: false,
        canceled_at: None,
        metadata: HashMap::from([
            ("user_id".to_string(), user_id.to_string()),
            ("plan_id".to_string(), plan.id.to_string()),
        ]),
    }
}

#[allow(dead_code)]
pub fn event(id: &str, kind: GatewayEvent) -> WebhookEvent {
    WebhookEvent {
        id: id.to_string(),
        event_type: kind.kind().to_string(),
        created: Utc::now(),
        kind,
    }
}

#[allow(dead_code)]
pub fn payment_failed(id: &str, sub: &Subscription) -> WebhookEvent {
    event(
        id,
        GatewayEvent::PaymentFailed {
            invoice_id: format!("in_{id}"),
            subscription_id: sub.external_subscription_id.clone(),
            attempt_count: 1,
        },
    )
}

#[allow(dead_code)]
pub fn payment_succeeded(id: &str, sub: &Subscription, amount_paid: i64) -> WebhookEvent {
    event(
        id,
        GatewayEvent::PaymentSucceeded {
            invoice_id: format!("in_{id}"),
            subscription_id: sub.external_subscription_id.clone(),
            amount_paid,
            period: None,
        },
    )
}
