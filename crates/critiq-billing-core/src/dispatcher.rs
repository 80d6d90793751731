//! Webhook event dispatch
//!
//! Every [`GatewayEvent`] variant has exactly one handler. Handlers are
//! idempotent: redelivered events either find the effect already recorded
//! (via the external id or the applied-event ledger) or re-decide to a no-op.

use chrono::Utc;
use critiq_types::{ExternalSubscriptionId, Plan, PlanId, Subscription, SubscriptionId, UserId};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::BillingError;
use crate::gateway::GatewaySubscription;
use crate::lifecycle::{Installed, Mutation};
use crate::machine;
use crate::service::BillingService;
use crate::webhook::{GatewayEvent, WebhookEvent};

/// What dispatching an event did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// New local subscription recorded
    Created { subscription_id: SubscriptionId },
    /// Existing subscription updated
    Updated { subscription_id: SubscriptionId },
    /// Subscription ended and user moved to the free tier
    Downgraded {
        subscription_id: SubscriptionId,
        free_subscription_id: SubscriptionId,
    },
    /// Nothing to do; the label says why
    Unchanged { reason: String },
    /// Event type not handled
    Ignored { event_type: String },
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Downgraded { .. } => "downgraded",
            Self::Unchanged { .. } => "unchanged",
            Self::Ignored { .. } => "ignored",
        }
    }

    fn unchanged(reason: &str) -> Self {
        Self::Unchanged {
            reason: reason.to_string(),
        }
    }
}

impl BillingService {
    /// Apply one verified gateway event
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<DispatchOutcome, BillingError> {
        match self.route(event).await {
            Ok(outcome) => Ok(self.finish(event, outcome)),
            Err(e) => {
                metrics::counter!(
                    "billing_webhooks_processed_total",
                    "event" => event.kind.kind(),
                    "status" => "error"
                )
                .increment(1);
                warn!(error = %e, "Webhook event failed");
                Err(e)
            }
        }
    }

    async fn route(&self, event: &WebhookEvent) -> Result<DispatchOutcome, BillingError> {
        match &event.kind {
            GatewayEvent::CheckoutCompleted {
                session_id,
                subscription_id,
                user_id,
                plan_id,
                ..
            } => {
                self.on_checkout_completed(session_id, subscription_id.as_ref(), *user_id, *plan_id)
                    .await
            }
            GatewayEvent::SubscriptionCreated(sub) => self.adopt(sub, None, None, None).await,
            GatewayEvent::SubscriptionUpdated(sub) => self.on_subscription_updated(&event.id, sub).await,
            GatewayEvent::SubscriptionDeleted(sub) => self.on_subscription_deleted(&event.id, sub).await,
            GatewayEvent::PaymentSucceeded {
                subscription_id,
                amount_paid,
                period,
                ..
            } => {
                let Some(local) = self.local_for(subscription_id.as_ref()).await? else {
                    return Ok(DispatchOutcome::unchanged("unknown_subscription"));
                };
                let now = Utc::now();
                let mutation = self
                    .mutate(local.id, |sub| {
                        machine::on_payment_succeeded(sub, &event.id, *amount_paid, *period, now)
                    })
                    .await?;
                self.settle(mutation).await
            }
            GatewayEvent::PaymentFailed {
                subscription_id,
                attempt_count,
                ..
            } => {
                let Some(local) = self.local_for(subscription_id.as_ref()).await? else {
                    return Ok(DispatchOutcome::unchanged("unknown_subscription"));
                };
                debug!(attempt_count, "Payment failed");
                let now = Utc::now();
                let threshold = self.config.payment_failure_threshold;
                let mutation = self
                    .mutate(local.id, |sub| {
                        machine::on_payment_failed(sub, &event.id, now, threshold)
                    })
                    .await?;
                self.settle(mutation).await
            }
            GatewayEvent::TrialWillEnd(sub) => {
                let Some(local) = self.local_for(Some(&sub.id)).await? else {
                    return Ok(DispatchOutcome::unchanged("unknown_subscription"));
                };
                let now = Utc::now();
                let mutation = self
                    .mutate(local.id, |current| {
                        Ok(machine::on_trial_will_end(current, &event.id, now))
                    })
                    .await?;
                self.settle(mutation).await
            }
            GatewayEvent::Ignored { event_type } => {
                warn!(event_type = %event_type, "Ignoring unhandled webhook event type");
                Ok(DispatchOutcome::Ignored {
                    event_type: event_type.clone(),
                })
            }
        }
    }

    fn finish(&self, event: &WebhookEvent, outcome: DispatchOutcome) -> DispatchOutcome {
        metrics::counter!(
            "billing_webhooks_processed_total",
            "event" => event.kind.kind(),
            "status" => outcome.label()
        )
        .increment(1);
        debug!(outcome = ?outcome, "Webhook event processed");
        outcome
    }

    async fn local_for(
        &self,
        external_id: Option<&ExternalSubscriptionId>,
    ) -> Result<Option<Subscription>, BillingError> {
        match external_id {
            Some(id) => Ok(self.stores.subscriptions.find_by_external_id(id).await?),
            None => Ok(None),
        }
    }

    /// Turn a mutation into an outcome, finishing any downgrade it started
    async fn settle(&self, mutation: Mutation) -> Result<DispatchOutcome, BillingError> {
        match mutation {
            Mutation::Unchanged { reason, .. } => Ok(DispatchOutcome::unchanged(reason)),
            Mutation::Committed(sub) => Ok(DispatchOutcome::Updated {
                subscription_id: sub.id,
            }),
            closed @ Mutation::Closed { .. } => {
                let downgrade = self.complete_downgrade(closed).await?;
                let subscription_id = downgrade
                    .closed
                    .as_ref()
                    .map_or(downgrade.free.id, |sub| sub.id);
                Ok(DispatchOutcome::Downgraded {
                    subscription_id,
                    free_subscription_id: downgrade.free.id,
                })
            }
        }
    }

    async fn on_checkout_completed(
        &self,
        session_id: &str,
        subscription_id: Option<&ExternalSubscriptionId>,
        user_hint: Option<UserId>,
        plan_hint: Option<PlanId>,
    ) -> Result<DispatchOutcome, BillingError> {
        let Some(external_id) = subscription_id else {
            return Ok(DispatchOutcome::unchanged("no_subscription"));
        };
        if self.local_for(Some(external_id)).await?.is_some() {
            return Ok(DispatchOutcome::unchanged("already_recorded"));
        }

        let gateway_sub = self
            .gateway
            .retrieve_subscription(external_id)
            .await
            .map_err(BillingError::from)?;
        self.adopt(&gateway_sub, Some(session_id), user_hint, plan_hint)
            .await
    }

    /// Record a gateway subscription we have no local record for
    async fn adopt(
        &self,
        gateway_sub: &GatewaySubscription,
        session_id: Option<&str>,
        user_hint: Option<UserId>,
        plan_hint: Option<PlanId>,
    ) -> Result<DispatchOutcome, BillingError> {
        if self.local_for(Some(&gateway_sub.id)).await?.is_some() {
            return Ok(DispatchOutcome::unchanged("already_recorded"));
        }
        match gateway_sub.local_status() {
            Some(status) if status.is_current() => {}
            _ => return Ok(DispatchOutcome::unchanged("not_current")),
        }

        let user_id = match user_hint.or_else(|| gateway_sub.user_id()) {
            Some(user_id) => user_id,
            None => self
                .stores
                .accounts
                .find_by_customer_id(&gateway_sub.customer_id)
                .await?
                .map(|account| account.user_id)
                .ok_or(BillingError::UserNotFound)?,
        };
        let plan = self.plan_for(gateway_sub, plan_hint).await?;

        let (mut new, notice) = machine::new_paid_subscription(user_id, &plan, gateway_sub, Utc::now())?;
        new.metadata.checkout_session_id = session_id.map(str::to_string);

        self.remember_customer(user_id, &gateway_sub.customer_id).await;
        match self.install(new, notice).await? {
            Installed::Created(sub) => Ok(DispatchOutcome::Created {
                subscription_id: sub.id,
            }),
            Installed::AlreadyRecorded(_) => Ok(DispatchOutcome::unchanged("already_recorded")),
        }
    }

    async fn plan_for(
        &self,
        gateway_sub: &GatewaySubscription,
        plan_hint: Option<PlanId>,
    ) -> Result<Plan, BillingError> {
        if let Some(price_id) = &gateway_sub.price_id {
            if let Some(plan) = self.catalog.find_by_price(price_id).await? {
                return Ok(plan);
            }
        }
        match plan_hint.or_else(|| gateway_sub.plan_id()) {
            Some(plan_id) => self.catalog.get_any(plan_id).await,
            None => Err(BillingError::PlanNotFound),
        }
    }

    async fn on_subscription_updated(
        &self,
        event_id: &str,
        gateway_sub: &GatewaySubscription,
    ) -> Result<DispatchOutcome, BillingError> {
        let Some(local) = self.local_for(Some(&gateway_sub.id)).await? else {
            // Updated can arrive before created
            return self.adopt(gateway_sub, None, None, None).await;
        };

        let plan = match &gateway_sub.price_id {
            Some(price_id) if local.external_price_id.as_ref() != Some(price_id) => {
                match self.catalog.find_by_price(price_id).await? {
                    Some(plan) => plan,
                    None => {
                        warn!(price_id = %price_id, "Unknown gateway price, keeping current plan");
                        self.catalog.get_any(local.plan_id).await?
                    }
                }
            }
            _ => self.catalog.get_any(local.plan_id).await?,
        };

        let now = Utc::now();
        let mutation = self
            .mutate(local.id, |sub| {
                machine::on_gateway_update(sub, gateway_sub, &plan, event_id, now)
            })
            .await?;
        if let Mutation::Committed(sub) = &mutation {
            info!(subscription_id = %sub.id, status = %sub.status, "Applied gateway update");
        }
        self.settle(mutation).await
    }

    async fn on_subscription_deleted(
        &self,
        event_id: &str,
        gateway_sub: &GatewaySubscription,
    ) -> Result<DispatchOutcome, BillingError> {
        let Some(local) = self.local_for(Some(&gateway_sub.id)).await? else {
            return Ok(DispatchOutcome::unchanged("unknown_subscription"));
        };
        let mutation = self
            .mutate(local.id, |sub| Ok(machine::on_gateway_deleted(sub, event_id)))
            .await?;
        match mutation {
            // Already ended locally; make sure the free tier exists anyway
            Mutation::Unchanged { current, .. } if current.status.is_terminal() => {
                self.ensure_free_tier(current.user_id, None).await?;
                Ok(DispatchOutcome::unchanged("terminal"))
            }
            other => self.settle(other).await,
        }
    }
}
