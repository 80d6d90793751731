//! Payment gateway abstraction
//!
//! The engine talks to the payment processor only through [`PaymentGateway`].
//! All objects are keyed by opaque string handles. Mutating calls take an
//! [`IdempotencyKey`] so a repeated logical operation never creates a second
//! gateway object.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use critiq_types::{
    CheckoutSession, CustomerId, ExternalSubscriptionId, PaymentMethod, PlanId, PriceId,
    SubscriptionStatus, UserId,
};
use tracing::warn;

use crate::error::GatewayError;
use crate::retry::{with_retry, RetryConfig};

/// Result alias for gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Key sent with mutating calls; equal keys mean "same operation".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Build a key from an operation name and the identifiers that make it unique
    pub fn new(operation: &str, parts: &[&dyn std::fmt::Display]) -> Self {
        let mut key = operation.to_string();
        for part in parts {
            key.push(':');
            key.push_str(&part.to_string());
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gateway customer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCustomer {
    pub id: CustomerId,
    pub email: Option<String>,
    pub deleted: bool,
    pub default_payment_method: Option<String>,
}

/// Gateway view of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySubscription {
    pub id: ExternalSubscriptionId,
    pub customer_id: CustomerId,
    /// Raw gateway status; see [`GatewaySubscription::local_status`]
    pub status: String,
    pub price_id: Option<PriceId>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl GatewaySubscription {
    /// Map the gateway status onto a local status.
    ///
    /// `incomplete` and `paused` have no local counterpart and map to `None`.
    pub fn local_status(&self) -> Option<SubscriptionStatus> {
        self.status.parse().ok()
    }

    /// User id stamped into the subscription metadata at checkout
    pub fn user_id(&self) -> Option<UserId> {
        self.metadata
            .get("user_id")
            .and_then(|v| UserId::parse(v).ok())
    }

    /// Plan id stamped into the subscription metadata at checkout
    pub fn plan_id(&self) -> Option<PlanId> {
        self.metadata
            .get("plan_id")
            .and_then(|v| PlanId::parse(v).ok())
    }
}

/// Customer creation request
#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub user_id: UserId,
    pub email: String,
    pub name: Option<String>,
}

/// Subscription creation request
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: CustomerId,
    pub price_id: PriceId,
    pub user_id: UserId,
    pub plan_id: PlanId,
}

/// Partial subscription update
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub cancel_at_period_end: Option<bool>,
}

/// Hosted checkout request
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub customer_id: CustomerId,
    pub price_id: PriceId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub trial_period_days: Option<u32>,
    pub success_url: String,
    pub cancel_url: String,
}

/// Payment gateway capability interface
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(
        &self,
        customer: &NewCustomer,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewayCustomer>;

    async fn retrieve_customer(&self, id: &CustomerId) -> GatewayResult<GatewayCustomer>;

    async fn create_subscription(
        &self,
        request: &NewSubscription,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription>;

    async fn update_subscription(
        &self,
        id: &ExternalSubscriptionId,
        update: &SubscriptionUpdate,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription>;

    async fn retrieve_subscription(
        &self,
        id: &ExternalSubscriptionId,
    ) -> GatewayResult<GatewaySubscription>;

    /// Cancel immediately
    async fn cancel_subscription(
        &self,
        id: &ExternalSubscriptionId,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription>;

    async fn list_payment_methods(&self, customer: &CustomerId)
        -> GatewayResult<Vec<PaymentMethod>>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
        key: &IdempotencyKey,
    ) -> GatewayResult<CheckoutSession>;
}

/// Decorator bounding every call with a timeout and retrying reads once.
pub struct TimedGateway {
    inner: Arc<dyn PaymentGateway>,
    timeout: Duration,
    read_retry: RetryConfig,
}

impl TimedGateway {
    pub fn new(inner: Arc<dyn PaymentGateway>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            read_retry: RetryConfig::default(),
        }
    }

    /// Override the read retry policy
    pub fn with_read_retry(mut self, config: RetryConfig) -> Self {
        self.read_retry = config;
        self
    }

    async fn timed<T>(&self, call: impl Future<Output = GatewayResult<T>>) -> GatewayResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "gateway call timed out");
                Err(GatewayError::Timeout)
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for TimedGateway {
    async fn create_customer(
        &self,
        customer: &NewCustomer,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewayCustomer> {
        self.timed(self.inner.create_customer(customer, key)).await
    }

    async fn retrieve_customer(&self, id: &CustomerId) -> GatewayResult<GatewayCustomer> {
        with_retry(&self.read_retry, move || self.timed(self.inner.retrieve_customer(id))).await
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        self.timed(self.inner.create_subscription(request, key)).await
    }

    async fn update_subscription(
        &self,
        id: &ExternalSubscriptionId,
        update: &SubscriptionUpdate,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        self.timed(self.inner.update_subscription(id, update, key))
            .await
    }

    async fn retrieve_subscription(
        &self,
        id: &ExternalSubscriptionId,
    ) -> GatewayResult<GatewaySubscription> {
        with_retry(&self.read_retry, move || {
            self.timed(self.inner.retrieve_subscription(id))
        })
        .await
    }

    async fn cancel_subscription(
        &self,
        id: &ExternalSubscriptionId,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        self.timed(self.inner.cancel_subscription(id, key)).await
    }

    async fn list_payment_methods(
        &self,
        customer: &CustomerId,
    ) -> GatewayResult<Vec<PaymentMethod>> {
        with_retry(&self.read_retry, move || {
            self.timed(self.inner.list_payment_methods(customer))
        })
        .await
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
        key: &IdempotencyKey,
    ) -> GatewayResult<CheckoutSession> {
        self.timed(self.inner.create_checkout_session(request, key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Gateway whose reads hang and whose customer lookups fail transiently once
    #[derive(Default)]
    struct SlowGateway {
        customer_calls: AtomicU32,
        cancel_calls: AtomicU32,
    }

    fn customer() -> GatewayCustomer {
        GatewayCustomer {
            id: CustomerId::new("cus_1"),
            email: None,
            deleted: false,
            default_payment_method: None,
        }
    }

    #[async_trait]
    impl PaymentGateway for SlowGateway {
        async fn create_customer(
            &self,
            _: &NewCustomer,
            _: &IdempotencyKey,
        ) -> GatewayResult<GatewayCustomer> {
            Ok(customer())
        }

        async fn retrieve_customer(&self, _: &CustomerId) -> GatewayResult<GatewayCustomer> {
            if self.customer_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(customer())
        }

        async fn create_subscription(
            &self,
            _: &NewSubscription,
            _: &IdempotencyKey,
        ) -> GatewayResult<GatewaySubscription> {
            Err(GatewayError::InvalidRequest("unused".to_string()))
        }

        async fn update_subscription(
            &self,
            _: &ExternalSubscriptionId,
            _: &SubscriptionUpdate,
            _: &IdempotencyKey,
        ) -> GatewayResult<GatewaySubscription> {
            Err(GatewayError::InvalidRequest("unused".to_string()))
        }

        async fn retrieve_subscription(
            &self,
            id: &ExternalSubscriptionId,
        ) -> GatewayResult<GatewaySubscription> {
            Err(GatewayError::ResourceMissing(id.to_string()))
        }

        async fn cancel_subscription(
            &self,
            _: &ExternalSubscriptionId,
            _: &IdempotencyKey,
        ) -> GatewayResult<GatewaySubscription> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(GatewayError::InvalidRequest("unreachable".to_string()))
        }

        async fn list_payment_methods(&self, _: &CustomerId) -> GatewayResult<Vec<PaymentMethod>> {
            Ok(vec![])
        }

        async fn create_checkout_session(
            &self,
            _: &CheckoutRequest,
            _: &IdempotencyKey,
        ) -> GatewayResult<CheckoutSession> {
            Err(GatewayError::InvalidRequest("unused".to_string()))
        }
    }

    fn timed(inner: Arc<SlowGateway>) -> TimedGateway {
        TimedGateway::new(inner, Duration::from_millis(50))
            .with_read_retry(RetryConfig::new().with_base_delay(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_read_timeout_is_retried_once() {
        let inner = Arc::new(SlowGateway::default());
        let gateway = timed(inner.clone());

        let found = gateway.retrieve_customer(&CustomerId::new("cus_1")).await;
        assert!(found.is_ok());
        assert_eq!(inner.customer_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mutation_timeout_is_not_retried() {
        let inner = Arc::new(SlowGateway::default());
        let gateway = timed(inner.clone());
        let key = IdempotencyKey::new("cancel", &[&"sub_1"]);

        let result = gateway
            .cancel_subscription(&ExternalSubscriptionId::new("sub_1"), &key)
            .await;
        assert_eq!(result, Err(GatewayError::Timeout));
        assert_eq!(inner.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_read_error_passes_through() {
        let gateway = timed(Arc::new(SlowGateway::default()));
        let result = gateway
            .retrieve_subscription(&ExternalSubscriptionId::new("sub_gone"))
            .await;
        assert!(matches!(result, Err(GatewayError::ResourceMissing(_))));
    }

    #[test]
    fn test_idempotency_key_format() {
        let key = IdempotencyKey::new("reactivate", &[&"sub_1", &3]);
        assert_eq!(key.as_str(), "reactivate:sub_1:3");
    }
}
