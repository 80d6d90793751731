//! Subscription write primitives
//!
//! All subscription writes go through here. Updates are compare-and-swap on
//! the record version: on a lost race the record is re-read and the decision
//! re-made from fresh state. Notices are published only after the write that
//! produced them commits.

use chrono::Utc;
use critiq_types::{CancellationReason, Subscription, SubscriptionId};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::BillingError;
use crate::machine::{self, Outcome};
use crate::notify::{Notice, TemplateKind};
use crate::service::BillingService;

/// What a compare-and-swap write did
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Decision was a no-op
    Unchanged {
        current: Subscription,
        reason: &'static str,
    },
    /// Record updated
    Committed(Subscription),
    /// Record closed; the user still needs a free-tier record
    Closed {
        closed: Subscription,
        reason: CancellationReason,
    },
}

impl Mutation {
    pub fn subscription(&self) -> &Subscription {
        match self {
            Self::Unchanged { current, .. } => current,
            Self::Committed(sub) => sub,
            Self::Closed { closed, .. } => closed,
        }
    }
}

/// Result of installing a new current record
#[derive(Debug, Clone, PartialEq)]
pub enum Installed {
    Created(Subscription),
    /// A record for the same gateway subscription already existed
    AlreadyRecorded(Subscription),
}

impl Installed {
    pub fn into_subscription(self) -> Subscription {
        match self {
            Self::Created(sub) | Self::AlreadyRecorded(sub) => sub,
        }
    }
}

impl BillingService {
    /// Read, decide, conditionally write; repeat on version conflict.
    ///
    /// `decide` must be pure: it may run several times.
    pub(crate) async fn mutate<F>(
        &self,
        id: SubscriptionId,
        mut decide: F,
    ) -> Result<Mutation, BillingError>
    where
        F: FnMut(&Subscription) -> Result<Outcome, BillingError> + Send,
    {
        let max_attempts = self.config.max_write_attempts;

        for attempt in 1..=max_attempts {
            let current = self
                .stores
                .subscriptions
                .find_by_id(id)
                .await?
                .ok_or(BillingError::SubscriptionNotFound)?;

            let (mut next, notice, closed_reason) = match decide(&current)? {
                Outcome::Unchanged(reason) => {
                    debug!(subscription_id = %id, reason, "No change");
                    return Ok(Mutation::Unchanged { current, reason });
                }
                Outcome::Update { next, notice } => (next, notice, None),
                Outcome::Downgrade { reason, mut next } => {
                    machine::close_record(&mut next, reason, Utc::now())?;
                    let notice = Notice::new(TemplateKind::SubscriptionCanceled)
                        .with_data(json!({ "reason": reason.as_str() }));
                    (next, Some(notice), Some(reason))
                }
            };
            next.updated_at = Utc::now();

            match self.stores.subscriptions.update(&next).await {
                Ok(stored) => {
                    if stored.status != current.status {
                        metrics::counter!(
                            "billing_transitions_total",
                            "from" => current.status.as_str(),
                            "to" => stored.status.as_str()
                        )
                        .increment(1);
                        info!(
                            subscription_id = %id,
                            user_id = %stored.user_id,
                            from = %current.status,
                            to = %stored.status,
                            "Subscription transitioned"
                        );
                    }
                    if let Some(notice) = notice {
                        self.outbox.publish(stored.user_id, stored.id, &notice);
                    }
                    return Ok(match closed_reason {
                        Some(reason) => Mutation::Closed {
                            closed: stored,
                            reason,
                        },
                        None => Mutation::Committed(stored),
                    });
                }
                Err(e) if e.is_conflict() => {
                    metrics::counter!("billing_write_conflicts_total").increment(1);
                    warn!(subscription_id = %id, attempt, "Version conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BillingError::Conflict(format!(
            "subscription {id} still contended after {max_attempts} attempts"
        )))
    }

    /// Make `new` the user's current record, retiring whatever is current.
    ///
    /// A gateway-backed record is skipped when one for the same gateway
    /// subscription already exists, so duplicate creation events converge.
    pub(crate) async fn install(
        &self,
        new: Subscription,
        notice: Notice,
    ) -> Result<Installed, BillingError> {
        let max_attempts = self.config.max_write_attempts;

        for attempt in 1..=max_attempts {
            if let Some(external_id) = &new.external_subscription_id {
                if let Some(existing) = self
                    .stores
                    .subscriptions
                    .find_by_external_id(external_id)
                    .await?
                {
                    debug!(external_id = %external_id, "Gateway subscription already recorded");
                    return Ok(Installed::AlreadyRecorded(existing));
                }
            }

            if let Some(current) = self
                .stores
                .subscriptions
                .find_current_by_user_id(new.user_id)
                .await?
            {
                let now = Utc::now();
                let retired = self
                    .mutate(current.id, |sub| machine::on_replaced(sub, now))
                    .await?;
                if let Mutation::Committed(retired) = &retired {
                    self.cancel_at_gateway(retired).await;
                }
                info!(
                    user_id = %new.user_id,
                    replaced = %current.id,
                    "Retired current subscription"
                );
            }

            match self.stores.subscriptions.insert(&new).await {
                Ok(stored) => {
                    metrics::counter!(
                        "billing_transitions_total",
                        "from" => "none",
                        "to" => stored.status.as_str()
                    )
                    .increment(1);
                    info!(
                        subscription_id = %stored.id,
                        user_id = %stored.user_id,
                        plan_id = %stored.plan_id,
                        status = %stored.status,
                        "Subscription created"
                    );
                    self.outbox.publish(stored.user_id, stored.id, &notice);
                    return Ok(Installed::Created(stored));
                }
                Err(e) if e.is_conflict() => {
                    metrics::counter!("billing_write_conflicts_total").increment(1);
                    warn!(user_id = %new.user_id, attempt, "Insert conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BillingError::Conflict(format!(
            "could not install subscription for user {} after {max_attempts} attempts",
            new.user_id
        )))
    }
}
