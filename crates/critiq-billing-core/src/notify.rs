//! Notification outbox
//!
//! State transitions publish [`OutboundMessage`]s after their write commits.
//! Messages travel over an in-process channel to a worker that hands them to
//! a [`Notifier`]. Delivery failures are logged and counted; they never reach
//! the code that made the transition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use critiq_types::{SubscriptionId, UserId};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::NotifyError;

/// Delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// In-app notification
    Notification,
    /// Templated email
    Email,
}

/// Message template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    TrialStarted,
    SubscriptionActivated,
    SubscriptionRenewed,
    PlanChanged,
    PastDue,
    PaymentRecovered,
    CancellationScheduled,
    CancellationRevoked,
    SubscriptionCanceled,
    DowngradedToFree,
    FreeTierStarted,
    TrialEnding,
    SubscriptionReactivated,
}

impl TemplateKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TrialStarted => "trial_started",
            Self::SubscriptionActivated => "subscription_activated",
            Self::SubscriptionRenewed => "subscription_renewed",
            Self::PlanChanged => "plan_changed",
            Self::PastDue => "past_due",
            Self::PaymentRecovered => "payment_recovered",
            Self::CancellationScheduled => "cancellation_scheduled",
            Self::CancellationRevoked => "cancellation_revoked",
            Self::SubscriptionCanceled => "subscription_canceled",
            Self::DowngradedToFree => "downgraded_to_free",
            Self::FreeTierStarted => "free_tier_started",
            Self::TrialEnding => "trial_ending",
            Self::SubscriptionReactivated => "subscription_reactivated",
        }
    }

    /// Lifecycle milestones also get an email
    pub const fn is_milestone(&self) -> bool {
        matches!(
            self,
            Self::TrialStarted
                | Self::SubscriptionActivated
                | Self::SubscriptionReactivated
                | Self::SubscriptionCanceled
                | Self::PastDue
                | Self::TrialEnding
        )
    }
}

/// What a committed transition wants to tell the user
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub template: TemplateKind,
    pub data: serde_json::Value,
}

impl Notice {
    pub fn new(template: TemplateKind) -> Self {
        Self {
            template,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// A queued message
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub channel: Channel,
    pub template: TemplateKind,
    pub user_id: UserId,
    pub subscription_id: SubscriptionId,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Sending half of the outbox
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

/// Receiving half of the outbox
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Outbox {
    /// Create a connected outbox/receiver pair
    pub fn channel() -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, OutboxReceiver { rx })
    }

    /// Queue the messages for one committed transition: one notification,
    /// plus an email when the template is a lifecycle milestone.
    pub fn publish(&self, user_id: UserId, subscription_id: SubscriptionId, notice: &Notice) {
        let now = Utc::now();
        let mut channels = vec![Channel::Notification];
        if notice.template.is_milestone() {
            channels.push(Channel::Email);
        }

        for channel in channels {
            let message = OutboundMessage {
                id: Uuid::new_v4(),
                channel,
                template: notice.template,
                user_id,
                subscription_id,
                data: notice.data.clone(),
                created_at: now,
            };
            if self.tx.send(message).is_err() {
                metrics::counter!("billing_notifications_total", "result" => "dropped")
                    .increment(1);
                warn!(
                    user_id = %user_id,
                    template = notice.template.as_str(),
                    "notification outbox closed, message dropped"
                );
            }
        }
    }
}

impl OutboxReceiver {
    /// Wait for the next message; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.rx.recv().await
    }

    /// Take every message queued so far without waiting
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// Notification/email sender
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError>;
}

/// Posts each message as JSON to a webhook endpoint
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Logs messages instead of delivering them
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        info!(
            user_id = %message.user_id,
            subscription_id = %message.subscription_id,
            channel = ?message.channel,
            template = message.template.as_str(),
            "notification"
        );
        Ok(())
    }
}

/// Drain the outbox into a notifier until every sender is dropped
pub async fn run_notification_worker(mut outbox: OutboxReceiver, notifier: Arc<dyn Notifier>) {
    info!("Notification worker started");

    while let Some(message) = outbox.recv().await {
        match notifier.send(&message).await {
            Ok(()) => {
                metrics::counter!("billing_notifications_total", "result" => "sent").increment(1);
                debug!(message_id = %message.id, "notification delivered");
            }
            Err(e) => {
                metrics::counter!("billing_notifications_total", "result" => "failed")
                    .increment(1);
                warn!(
                    message_id = %message.id,
                    user_id = %message.user_id,
                    template = message.template.as_str(),
                    error = %e,
                    "notification delivery failed"
                );
            }
        }
    }

    info!("Notification worker stopped");
}
