//! Billing service
//!
//! [`BillingService`] owns the stores, plan catalog, gateway and outbox. Its
//! operations are split by concern: write primitives in `lifecycle`, webhook
//! dispatch in `dispatcher`, user-facing flows in `orchestrator` and periodic
//! reconciliation in `sweep`.

use std::sync::Arc;

use chrono::Utc;
use critiq_db::Stores;
use critiq_types::{BillingAccount, CustomerId, Plan, Subscription, UserId};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::catalog::PlanCatalog;
use crate::config::BillingConfig;
use crate::dispatcher::DispatchOutcome;
use crate::error::BillingError;
use crate::gateway::{IdempotencyKey, NewCustomer, PaymentGateway};
use crate::notify::Outbox;
use crate::webhook::{parse_event, WebhookVerifier};

/// Billing service
pub struct BillingService {
    pub(crate) stores: Stores,
    pub(crate) catalog: PlanCatalog,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) outbox: Outbox,
    pub(crate) verifier: WebhookVerifier,
    pub(crate) config: BillingConfig,
}

/// A user's current subscription with its plan
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub plan: Plan,
}

impl BillingService {
    /// Create a new billing service
    pub fn new(
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
        outbox: Outbox,
        config: BillingConfig,
    ) -> Self {
        let verifier = WebhookVerifier::new(
            config.stripe_webhook_secret.clone(),
            config.webhook_tolerance_secs,
        );
        Self {
            catalog: PlanCatalog::new(stores.plans.clone()),
            stores,
            gateway,
            outbox,
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Current subscription and plan for a user
    #[instrument(skip(self))]
    pub async fn get_subscription(&self, user_id: UserId) -> Result<SubscriptionView, BillingError> {
        let subscription = self
            .stores
            .subscriptions
            .find_current_by_user_id(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;
        let plan = self.catalog.get_any(subscription.plan_id).await?;
        Ok(SubscriptionView { subscription, plan })
    }

    /// Subscription history for a user, newest first
    pub async fn list_subscriptions(&self, user_id: UserId) -> Result<Vec<Subscription>, BillingError> {
        Ok(self.stores.subscriptions.list_by_user_id(user_id).await?)
    }

    /// Verify, parse and dispatch a raw webhook delivery
    #[instrument(skip(self, payload, signature), fields(len = payload.len()))]
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<DispatchOutcome, BillingError> {
        self.verifier.verify(payload, signature, Utc::now())?;
        let event = parse_event(payload)?;
        self.dispatch(&event).await
    }

    pub(crate) async fn account(&self, user_id: UserId) -> Result<BillingAccount, BillingError> {
        self.stores
            .accounts
            .find_by_id(user_id)
            .await?
            .ok_or(BillingError::UserNotFound)
    }

    /// Gateway customer for a user, created on first use
    pub(crate) async fn resolve_customer(&self, user_id: UserId) -> Result<CustomerId, BillingError> {
        let account = self.account(user_id).await?;
        if let Some(customer_id) = account.customer_id {
            return Ok(customer_id);
        }

        let key = IdempotencyKey::new("customer", &[&user_id]);
        let customer = self
            .gateway
            .create_customer(
                &NewCustomer {
                    user_id,
                    email: account.email,
                    name: account.name,
                },
                &key,
            )
            .await
            .map_err(|e| BillingError::gateway(e, &self.config.settings_url))?;

        self.stores
            .accounts
            .set_customer_id(user_id, &customer.id)
            .await?;
        info!(user_id = %user_id, customer_id = %customer.id, "Created gateway customer");
        Ok(customer.id)
    }

    /// Remember a customer handle learned from the gateway. Failures are
    /// logged; the handle can be recovered from the subscription record.
    pub(crate) async fn remember_customer(&self, user_id: UserId, customer_id: &CustomerId) {
        match self.stores.accounts.find_by_id(user_id).await {
            Ok(Some(account)) if account.customer_id.is_none() => {
                if let Err(e) = self.stores.accounts.set_customer_id(user_id, customer_id).await {
                    warn!(user_id = %user_id, error = %e, "Failed to store customer id");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(user_id = %user_id, error = %e, "Failed to load account"),
        }
    }
}
