//! In-memory payment gateway for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use critiq_billing_core::{
    CheckoutRequest, GatewayCustomer, GatewayError, GatewayResult, GatewaySubscription,
    IdempotencyKey, NewCustomer, NewSubscription, PaymentGateway, SubscriptionUpdate,
};
use critiq_types::{
    CheckoutSession, CustomerId, ExternalSubscriptionId, PaymentMethod, PaymentMethodType,
};
use dashmap::DashMap;

/// Recording gateway. Subscriptions live in a map keyed by gateway id;
/// mutating calls replay their first result for a repeated idempotency key.
#[derive(Default)]
pub struct MockGateway {
    calls: Mutex<Vec<String>>,
    pub subscriptions: DashMap<String, GatewaySubscription>,
    payment_methods: Mutex<Vec<PaymentMethod>>,
    fail_next: Mutex<Option<GatewayError>>,
    created_by_key: DashMap<String, GatewaySubscription>,
    counter: AtomicUsize,
}

#[allow(dead_code)]
impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the calls made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    /// Make the next call fail with `err`
    pub fn fail_next(&self, err: GatewayError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn set_payment_methods(&self, methods: Vec<PaymentMethod>) {
        *self.payment_methods.lock().unwrap() = methods;
    }

    /// A card that does not expire soon
    pub fn valid_card() -> PaymentMethod {
        PaymentMethod {
            id: "pm_valid".to_string(),
            method_type: PaymentMethodType::Card,
            is_default: true,
            card_brand: Some("visa".to_string()),
            card_last4: Some("4242".to_string()),
            card_exp_month: Some(12),
            card_exp_year: Some(2099),
        }
    }

    pub fn expired_card() -> PaymentMethod {
        PaymentMethod {
            id: "pm_expired".to_string(),
            card_exp_month: Some(1),
            card_exp_year: Some(2020),
            ..Self::valid_card()
        }
    }

    pub fn put_subscription(&self, sub: GatewaySubscription) {
        self.subscriptions.insert(sub.id.0.clone(), sub);
    }

    pub fn subscription(&self, id: &ExternalSubscriptionId) -> Option<GatewaySubscription> {
        self.subscriptions.get(id.as_str()).map(|s| s.clone())
    }

    fn record(&self, name: &str) -> GatewayResult<()> {
        self.calls.lock().unwrap().push(name.to_string());
        match self.fail_next.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_mock_{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_customer(
        &self,
        customer: &NewCustomer,
        _key: &IdempotencyKey,
    ) -> GatewayResult<GatewayCustomer> {
        self.record("create_customer")?;
        Ok(GatewayCustomer {
            id: CustomerId::new(self.next_id("cus")),
            email: Some(customer.email.clone()),
            deleted: false,
            default_payment_method: None,
        })
    }

    async fn retrieve_customer(&self, id: &CustomerId) -> GatewayResult<GatewayCustomer> {
        self.record("retrieve_customer")?;
        Ok(GatewayCustomer {
            id: id.clone(),
            email: None,
            deleted: false,
            default_payment_method: None,
        })
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        self.record("create_subscription")?;
        if let Some(existing) = self.created_by_key.get(key.as_str()) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let sub = GatewaySubscription {
            id: ExternalSubscriptionId::new(self.next_id("sub")),
            customer_id: request.customer_id.clone(),
            status: "active".to_string(),
            price_id: Some(request.price_id.clone()),
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: HashMap::from([
                ("user_id".to_string(), request.user_id.to_string()),
                ("plan_id".to_string(), request.plan_id.to_string()),
            ]),
        };
        self.put_subscription(sub.clone());
        self.created_by_key.insert(key.as_str().to_string(), sub.clone());
        Ok(sub)
    }

    async fn update_subscription(
        &self,
        id: &ExternalSubscriptionId,
        update: &SubscriptionUpdate,
        _key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        self.record("update_subscription")?;
        let mut sub = self
            .subscriptions
            .get_mut(id.as_str())
            .ok_or_else(|| GatewayError::ResourceMissing(id.to_string()))?;
        if let Some(flag) = update.cancel_at_period_end {
            sub.cancel_at_period_end = flag;
        }
        Ok(sub.clone())
    }

    async fn retrieve_subscription(
        &self,
        id: &ExternalSubscriptionId,
    ) -> GatewayResult<GatewaySubscription> {
        self.record("retrieve_subscription")?;
        self.subscription(id)
            .ok_or_else(|| GatewayError::ResourceMissing(id.to_string()))
    }

    async fn cancel_subscription(
        &self,
        id: &ExternalSubscriptionId,
        _key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        self.record("cancel_subscription")?;
        let mut sub = self
            .subscriptions
            .get_mut(id.as_str())
            .ok_or_else(|| GatewayError::ResourceMissing(id.to_string()))?;
        sub.status = "canceled".to_string();
        sub.canceled_at = Some(Utc::now());
        Ok(sub.clone())
    }

    async fn list_payment_methods(&self, _customer: &CustomerId) -> GatewayResult<Vec<PaymentMethod>> {
        self.record("list_payment_methods")?;
        Ok(self.payment_methods.lock().unwrap().clone())
    }

    async fn create_checkout_session(
        &self,
        _request: &CheckoutRequest,
        _key: &IdempotencyKey,
    ) -> GatewayResult<CheckoutSession> {
        self.record("create_checkout_session")?;
        let session_id = self.next_id("cs");
        Ok(CheckoutSession {
            url: format!("https://checkout.test/{session_id}"),
            session_id,
        })
    }
}
