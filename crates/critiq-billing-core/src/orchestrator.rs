//! Downgrade, cancellation, reactivation and checkout flows

use chrono::{Datelike, Utc};
use critiq_types::{
    CancellationReason, CheckoutSession, PlanId, Subscription, SubscriptionId, SubscriptionStatus,
    UserId,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{BillingError, GatewayError};
use crate::gateway::{CheckoutRequest, IdempotencyKey, NewCustomer, NewSubscription, SubscriptionUpdate};
use crate::lifecycle::{Installed, Mutation};
use crate::machine::{self, Provenance};
use crate::notify::{Notice, TemplateKind};
use crate::service::BillingService;

/// How a reactivation was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactivationPath {
    /// Scheduled cancellation withdrawn on the live subscription
    CancellationRevoked,
    /// New gateway subscription created for a recently ended one
    Resubscribed,
}

impl ReactivationPath {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CancellationRevoked => "cancellation_revoked",
            Self::Resubscribed => "resubscribed",
        }
    }
}

/// Result of a reactivation
#[derive(Debug, Clone, Serialize)]
pub struct Reactivation {
    pub path: ReactivationPath,
    pub subscription: Subscription,
}

/// Result of a downgrade
#[derive(Debug, Clone, PartialEq)]
pub struct Downgrade {
    /// The record that was ended, or `None` if it was already terminal
    pub closed: Option<Subscription>,
    /// The user's current free-tier record
    pub free: Subscription,
}

impl BillingService {
    /// End a subscription and move its user to the free tier.
    ///
    /// Already-terminal records are left alone, but the free tier is still
    /// ensured so a partially failed earlier downgrade converges.
    #[instrument(skip(self))]
    pub async fn downgrade(
        &self,
        id: SubscriptionId,
        reason: CancellationReason,
    ) -> Result<Downgrade, BillingError> {
        let mutation = self
            .mutate(id, |sub| Ok(machine::on_downgrade_requested(sub, reason, None)))
            .await?;
        self.complete_downgrade(mutation).await
    }

    /// Second half of any downgrade: gateway cleanup, customer handle and
    /// the free-tier record. Safe to repeat.
    pub(crate) async fn complete_downgrade(
        &self,
        mutation: Mutation,
    ) -> Result<Downgrade, BillingError> {
        let (closed, reason) = match mutation {
            Mutation::Closed { closed, reason } => (closed, reason),
            other => {
                let current = other.subscription().clone();
                if current.is_current() {
                    // Nothing was ended; the record is still the user's plan
                    return Ok(Downgrade {
                        closed: None,
                        free: current,
                    });
                }
                let reason = current
                    .metadata
                    .cancellation_reason
                    .unwrap_or(CancellationReason::GatewayCanceled);
                let free = self
                    .ensure_free_tier(
                        current.user_id,
                        Some(Provenance {
                            from: current,
                            reason,
                        }),
                    )
                    .await?;
                return Ok(Downgrade { closed: None, free });
            }
        };

        metrics::counter!("billing_downgrades_total", "reason" => reason.as_str()).increment(1);
        info!(
            subscription_id = %closed.id,
            user_id = %closed.user_id,
            reason = %reason,
            "Subscription ended, moving user to free tier"
        );

        // Expiry included: a renewal that never reached us may still be billing
        if matches!(
            reason,
            CancellationReason::PaymentFailed
                | CancellationReason::PastDueGraceExceeded
                | CancellationReason::PeriodExpired
        ) {
            self.cancel_at_gateway(&closed).await;
        }
        self.ensure_customer_handle(&closed).await;

        let free = self
            .ensure_free_tier(
                closed.user_id,
                Some(Provenance {
                    from: closed.clone(),
                    reason,
                }),
            )
            .await?;
        Ok(Downgrade {
            closed: Some(closed),
            free,
        })
    }

    /// Stop gateway billing for a locally ended record. Best effort: the
    /// local record already decides entitlement.
    pub(crate) async fn cancel_at_gateway(&self, closed: &Subscription) {
        let Some(external_id) = &closed.external_subscription_id else {
            return;
        };
        let key = IdempotencyKey::new("downgrade-cancel", &[&closed.id]);
        match self.gateway.cancel_subscription(external_id, &key).await {
            Ok(_) | Err(GatewayError::ResourceMissing(_)) => {}
            Err(e) => warn!(
                subscription_id = %closed.id,
                external_id = %external_id,
                error = %e,
                "Gateway cancel failed after local downgrade"
            ),
        }
    }

    /// Keep a customer handle on the account so a later checkout or
    /// reactivation reuses the same gateway customer.
    async fn ensure_customer_handle(&self, closed: &Subscription) {
        let account = match self.stores.accounts.find_by_id(closed.user_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return,
            Err(e) => {
                warn!(user_id = %closed.user_id, error = %e, "Failed to load account");
                return;
            }
        };
        if account.customer_id.is_some() {
            return;
        }
        if let Some(customer_id) = &closed.customer_id {
            self.remember_customer(closed.user_id, customer_id).await;
            return;
        }

        let key = IdempotencyKey::new("customer", &[&closed.user_id]);
        let request = NewCustomer {
            user_id: closed.user_id,
            email: account.email,
            name: account.name,
        };
        match self.gateway.create_customer(&request, &key).await {
            Ok(customer) => self.remember_customer(closed.user_id, &customer.id).await,
            Err(e) => warn!(user_id = %closed.user_id, error = %e, "Customer creation failed"),
        }
    }

    /// Give the user a free-tier record unless they already have a current
    /// subscription.
    ///
    /// Without explicit provenance, the most recently ended paid record (if
    /// any) is linked so a repaired downgrade still records where it came from.
    pub async fn ensure_free_tier(
        &self,
        user_id: UserId,
        provenance: Option<Provenance>,
    ) -> Result<Subscription, BillingError> {
        let provenance = match provenance {
            Some(p) => Some(p),
            None => self
                .stores
                .subscriptions
                .find_latest_terminal_paid_by_user_id(user_id)
                .await?
                .map(|from| Provenance {
                    reason: from
                        .metadata
                        .cancellation_reason
                        .unwrap_or(CancellationReason::GatewayCanceled),
                    from,
                }),
        };

        let max_attempts = self.config.max_write_attempts;
        for attempt in 1..=max_attempts {
            if let Some(current) = self
                .stores
                .subscriptions
                .find_current_by_user_id(user_id)
                .await?
            {
                return Ok(current);
            }

            let free_plan = self.catalog.free_plan().await?;
            let (free, notice) =
                machine::new_free_subscription(user_id, &free_plan, provenance.as_ref(), Utc::now());

            match self.stores.subscriptions.insert(&free).await {
                Ok(stored) => {
                    metrics::counter!(
                        "billing_transitions_total",
                        "from" => "none",
                        "to" => stored.status.as_str()
                    )
                    .increment(1);
                    info!(user_id = %user_id, subscription_id = %stored.id, "Free tier record created");
                    self.outbox.publish(user_id, stored.id, &notice);
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() => {
                    warn!(user_id = %user_id, attempt, "Free tier insert conflict, re-checking");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BillingError::Conflict(format!(
            "could not ensure free tier for user {user_id}"
        )))
    }

    /// Put a newly registered user on the free tier
    #[instrument(skip(self))]
    pub async fn bootstrap_free_tier(&self, user_id: UserId) -> Result<Subscription, BillingError> {
        self.account(user_id).await?;
        self.ensure_free_tier(user_id, None).await
    }

    /// Cancel the user's paid subscription, at period end or immediately
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        user_id: UserId,
        at_period_end: bool,
    ) -> Result<Subscription, BillingError> {
        let current = self
            .stores
            .subscriptions
            .find_current_by_user_id(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;
        let Some(external_id) = current.external_subscription_id.clone() else {
            return Err(BillingError::Validation(
                "the free tier cannot be canceled".to_string(),
            ));
        };

        if at_period_end {
            if current.cancel_at_period_end {
                return Ok(current);
            }
            let key = IdempotencyKey::new("cancel-at-period-end", &[&current.id, &current.version]);
            self.gateway
                .update_subscription(
                    &external_id,
                    &SubscriptionUpdate {
                        cancel_at_period_end: Some(true),
                    },
                    &key,
                )
                .await
                .map_err(|e| BillingError::gateway(e, &self.config.settings_url))?;

            let now = Utc::now();
            let mutation = self
                .mutate(current.id, |sub| Ok(machine::on_cancel_scheduled(sub, now)))
                .await?;
            info!(user_id = %user_id, subscription_id = %current.id, "Cancellation scheduled");
            return Ok(mutation.subscription().clone());
        }

        let key = IdempotencyKey::new("cancel", &[&current.id]);
        match self.gateway.cancel_subscription(&external_id, &key).await {
            Ok(_) | Err(GatewayError::ResourceMissing(_)) => {}
            Err(e) => return Err(BillingError::gateway(e, &self.config.settings_url)),
        }

        let downgrade = self
            .downgrade(current.id, CancellationReason::UserRequested)
            .await?;
        Ok(downgrade.free)
    }

    /// Undo a cancellation.
    ///
    /// A live subscription with a scheduled cancellation gets the flag
    /// cleared. A paid subscription canceled within the reactivation window
    /// is re-created at the gateway on the same plan, charged to a saved
    /// payment method.
    #[instrument(skip(self))]
    pub async fn reactivate(&self, user_id: UserId) -> Result<Reactivation, BillingError> {
        let current = self
            .stores
            .subscriptions
            .find_current_by_user_id(user_id)
            .await?;

        if let Some(current) = current.filter(|sub| sub.is_external()) {
            if !current.cancel_at_period_end {
                return Err(BillingError::AlreadyActive);
            }
            return self.revoke_cancellation(current).await;
        }

        let previous = self
            .stores
            .subscriptions
            .find_latest_terminal_paid_by_user_id(user_id)
            .await?
            .ok_or_else(|| BillingError::NotReactivatable("no canceled subscription".to_string()))?;
        self.resubscribe(user_id, previous).await
    }

    async fn revoke_cancellation(&self, current: Subscription) -> Result<Reactivation, BillingError> {
        let Some(external_id) = &current.external_subscription_id else {
            return Err(BillingError::Internal("paid record without gateway id".to_string()));
        };
        let key = IdempotencyKey::new("reactivate", &[&current.id, &current.version]);
        self.gateway
            .update_subscription(
                external_id,
                &SubscriptionUpdate {
                    cancel_at_period_end: Some(false),
                },
                &key,
            )
            .await
            .map_err(|e| BillingError::gateway(e, &self.config.settings_url))?;

        let now = Utc::now();
        let mutation = self
            .mutate(current.id, |sub| machine::on_cancellation_revoked(sub, now))
            .await?;

        let path = ReactivationPath::CancellationRevoked;
        metrics::counter!("billing_reactivations_total", "path" => path.as_str()).increment(1);
        info!(user_id = %current.user_id, subscription_id = %current.id, "Scheduled cancellation revoked");
        Ok(Reactivation {
            path,
            subscription: mutation.subscription().clone(),
        })
    }

    async fn resubscribe(
        &self,
        user_id: UserId,
        previous: Subscription,
    ) -> Result<Reactivation, BillingError> {
        let now = Utc::now();
        if previous.status != SubscriptionStatus::Canceled {
            return Err(BillingError::NotReactivatable(format!(
                "previous subscription ended as {}",
                previous.status
            )));
        }
        let canceled_at = previous.canceled_at.unwrap_or(previous.updated_at);
        if now - canceled_at > self.config.reactivation_window {
            return Err(BillingError::NotReactivatable(format!(
                "canceled more than {} days ago",
                self.config.reactivation_window.num_days()
            )));
        }

        let plan = self.catalog.get(previous.plan_id).await?;
        let price_id = plan
            .external_price_id
            .clone()
            .ok_or_else(|| BillingError::NotReactivatable("plan has no gateway price".to_string()))?;

        let account = self.account(user_id).await?;
        let customer_id = account
            .customer_id
            .or_else(|| previous.customer_id.clone())
            .ok_or_else(|| {
                BillingError::gateway(GatewayError::NoPaymentMethod, &self.config.settings_url)
            })?;

        let methods = self
            .gateway
            .list_payment_methods(&customer_id)
            .await
            .map_err(|e| BillingError::gateway(e, &self.config.settings_url))?;
        if !methods.iter().any(|m| m.is_usable(now.year(), now.month())) {
            return Err(BillingError::gateway(
                GatewayError::NoPaymentMethod,
                &self.config.settings_url,
            ));
        }

        let key = IdempotencyKey::new("reactivate", &[&previous.id]);
        let gateway_sub = self
            .gateway
            .create_subscription(
                &NewSubscription {
                    customer_id: customer_id.clone(),
                    price_id,
                    user_id,
                    plan_id: plan.id,
                },
                &key,
            )
            .await
            .map_err(|e| BillingError::gateway(e, &self.config.settings_url))?;
        self.remember_customer(user_id, &customer_id).await;

        let (mut new, _) = machine::new_paid_subscription(user_id, &plan, &gateway_sub, now)?;
        new.metadata.reactivated_from = Some(previous.id);
        new.metadata.reactivated_at = Some(now);
        new.metadata.reactivation_count = previous.metadata.reactivation_count + 1;
        let notice = Notice::new(TemplateKind::SubscriptionReactivated).with_data(json!({
            "plan_id": plan.id,
            "plan_name": plan.name,
            "reactivated_from": previous.id,
        }));

        let subscription = match self.install(new, notice).await? {
            Installed::Created(sub) => sub,
            Installed::AlreadyRecorded(existing) => {
                // The creation webhook won the race; link the provenance
                let previous_id = previous.id;
                let mutation = self
                    .mutate(existing.id, |sub| {
                        if sub.metadata.reactivated_from.is_some() {
                            return Ok(machine::Outcome::Unchanged("already_linked"));
                        }
                        let mut next = sub.clone();
                        next.metadata.reactivated_from = Some(previous_id);
                        next.metadata.reactivated_at = Some(now);
                        Ok(machine::Outcome::Update { next, notice: None })
                    })
                    .await?;
                mutation.subscription().clone()
            }
        };

        let path = ReactivationPath::Resubscribed;
        metrics::counter!("billing_reactivations_total", "path" => path.as_str()).increment(1);
        info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            reactivated_from = %previous.id,
            "Subscription reactivated"
        );
        Ok(Reactivation { path, subscription })
    }

    /// Start a hosted checkout for a paid plan
    #[instrument(skip(self))]
    pub async fn create_checkout(
        &self,
        user_id: UserId,
        plan_id: PlanId,
    ) -> Result<CheckoutSession, BillingError> {
        let plan = self.catalog.get(plan_id).await?;
        if plan.is_free() {
            return Err(BillingError::Validation(
                "the free plan does not need checkout".to_string(),
            ));
        }
        let price_id = plan
            .external_price_id
            .clone()
            .ok_or_else(|| BillingError::Validation(format!("plan {plan_id} has no gateway price")))?;

        if let Some(current) = self
            .stores
            .subscriptions
            .find_current_by_user_id(user_id)
            .await?
        {
            // One gateway subscription per user; plan changes migrate it
            if current.is_external() {
                let message = if current.plan_id == plan.id {
                    "already subscribed to this plan"
                } else {
                    "an active paid subscription exists; change plans on it instead"
                };
                return Err(BillingError::Conflict(message.to_string()));
            }
        }

        let customer_id = self.resolve_customer(user_id).await?;
        let request = CheckoutRequest {
            customer_id,
            price_id,
            user_id,
            plan_id: plan.id,
            trial_period_days: plan.has_trial().then_some(plan.trial_period_days),
            success_url: self.config.success_url.clone(),
            cancel_url: self.config.cancel_url.clone(),
        };
        let key = IdempotencyKey::new("checkout", &[&user_id, &plan.id, &Uuid::new_v4()]);
        let session = self
            .gateway
            .create_checkout_session(&request, &key)
            .await
            .map_err(|e| BillingError::gateway(e, &self.config.settings_url))?;

        metrics::counter!("billing_checkouts_created_total").increment(1);
        info!(user_id = %user_id, plan_id = %plan.id, session_id = %session.session_id, "Checkout session created");
        Ok(session)
    }
}
