//! Stripe webhook verification and parsing

use chrono::{DateTime, TimeZone, Utc};
use critiq_types::{CustomerId, ExternalSubscriptionId, PlanId, UserId};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::BillingError;
use crate::gateway::GatewaySubscription;
use crate::stripe::StripeSubscription;

/// Typed gateway event. The set is closed; anything we do not act on
/// arrives as [`GatewayEvent::Ignored`].
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Hosted checkout finished
    CheckoutCompleted {
        session_id: String,
        customer_id: Option<CustomerId>,
        subscription_id: Option<ExternalSubscriptionId>,
        user_id: Option<UserId>,
        plan_id: Option<PlanId>,
    },
    SubscriptionCreated(GatewaySubscription),
    SubscriptionUpdated(GatewaySubscription),
    SubscriptionDeleted(GatewaySubscription),
    /// Invoice paid. `period` is the invoiced service period when present.
    PaymentSucceeded {
        invoice_id: String,
        subscription_id: Option<ExternalSubscriptionId>,
        amount_paid: i64,
        period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    },
    PaymentFailed {
        invoice_id: String,
        subscription_id: Option<ExternalSubscriptionId>,
        attempt_count: u32,
    },
    TrialWillEnd(GatewaySubscription),
    Ignored {
        event_type: String,
    },
}

impl GatewayEvent {
    /// Gateway subscription the event is about, if any
    pub fn external_subscription_id(&self) -> Option<&ExternalSubscriptionId> {
        match self {
            Self::CheckoutCompleted { subscription_id, .. }
            | Self::PaymentSucceeded { subscription_id, .. }
            | Self::PaymentFailed { subscription_id, .. } => subscription_id.as_ref(),
            Self::SubscriptionCreated(sub)
            | Self::SubscriptionUpdated(sub)
            | Self::SubscriptionDeleted(sub)
            | Self::TrialWillEnd(sub) => Some(&sub.id),
            Self::Ignored { .. } => None,
        }
    }

    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout_completed",
            Self::SubscriptionCreated(_) => "subscription_created",
            Self::SubscriptionUpdated(_) => "subscription_updated",
            Self::SubscriptionDeleted(_) => "subscription_deleted",
            Self::PaymentSucceeded { .. } => "payment_succeeded",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::TrialWillEnd(_) => "trial_will_end",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Verified webhook envelope
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    /// Gateway event ID, used for idempotency
    pub id: String,
    /// Raw gateway event type
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub kind: GatewayEvent,
}

/// Checks `Stripe-Signature` headers
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify a `t=<ts>,v1=<hex>` header against the raw payload.
    ///
    /// Any `v1` entry may match; the header carries several while the
    /// signing secret is being rotated.
    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let mut timestamp: Option<&str> = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = Some(value),
                    "v1" => signatures.push(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            warn!("Missing timestamp in webhook signature");
            BillingError::InvalidSignature("missing timestamp".to_string())
        })?;
        if signatures.is_empty() {
            warn!("Missing v1 signature in webhook signature");
            return Err(BillingError::InvalidSignature("missing signature".to_string()));
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| BillingError::InvalidSignature("invalid timestamp".to_string()))?;

        let expected = self.sign(timestamp, payload)?;
        if !signatures
            .iter()
            .any(|sig| constant_time_eq(sig.as_bytes(), expected.as_bytes()))
        {
            warn!("Webhook signature verification failed");
            return Err(BillingError::InvalidSignature(
                "signature mismatch".to_string(),
            ));
        }

        if (now.timestamp() - ts).abs() > self.tolerance_secs {
            warn!(timestamp = ts, now = now.timestamp(), "Webhook timestamp outside tolerance");
            return Err(BillingError::InvalidSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        Ok(())
    }

    /// Hex HMAC-SHA256 over `<timestamp>.<payload>`
    pub fn sign(&self, timestamp: &str, payload: &[u8]) -> Result<String, BillingError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Internal("HMAC error".to_string()))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Build a header for `payload` signed at `at`
    pub fn signature_header(&self, payload: &[u8], at: DateTime<Utc>) -> Result<String, BillingError> {
        let timestamp = at.timestamp().to_string();
        let signature = self.sign(&timestamp, payload)?;
        Ok(format!("t={timestamp},v1={signature}"))
    }
}

/// Constant-time comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Parse a verified payload into a typed event
pub fn parse_event(payload: &[u8]) -> Result<WebhookEvent, BillingError> {
    let raw: RawStripeEvent = serde_json::from_slice(payload)
        .map_err(|e| BillingError::Validation(format!("malformed webhook payload: {e}")))?;

    debug!(event_id = %raw.id, event_type = %raw.event_type, "Parsed webhook event");

    let created = Utc
        .timestamp_opt(raw.created, 0)
        .single()
        .ok_or_else(|| BillingError::Validation("invalid event timestamp".to_string()))?;
    let kind = parse_object(&raw.event_type, raw.data.object)?;

    Ok(WebhookEvent {
        id: raw.id,
        event_type: raw.event_type,
        created,
        kind,
    })
}

fn parse_object(event_type: &str, object: serde_json::Value) -> Result<GatewayEvent, BillingError> {
    let malformed = |e: serde_json::Error| {
        BillingError::Validation(format!("malformed {event_type} object: {e}"))
    };

    let event = match event_type {
        "checkout.session.completed" => {
            let session: RawCheckoutSession = serde_json::from_value(object).map_err(malformed)?;
            let user_id = session
                .metadata
                .get("user_id")
                .or(session.client_reference_id.as_ref())
                .and_then(|id| UserId::parse(id).ok());
            let plan_id = session
                .metadata
                .get("plan_id")
                .and_then(|id| PlanId::parse(id).ok());
            GatewayEvent::CheckoutCompleted {
                session_id: session.id,
                customer_id: session.customer.map(CustomerId::new),
                subscription_id: session.subscription.map(ExternalSubscriptionId::new),
                user_id,
                plan_id,
            }
        }
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted"
        | "customer.subscription.trial_will_end" => {
            let sub: StripeSubscription = serde_json::from_value(object).map_err(malformed)?;
            let sub = sub
                .into_gateway()
                .map_err(|e| BillingError::Validation(format!("malformed {event_type} object: {e}")))?;
            match event_type {
                "customer.subscription.created" => GatewayEvent::SubscriptionCreated(sub),
                "customer.subscription.updated" => GatewayEvent::SubscriptionUpdated(sub),
                "customer.subscription.deleted" => GatewayEvent::SubscriptionDeleted(sub),
                _ => GatewayEvent::TrialWillEnd(sub),
            }
        }
        "invoice.paid" | "invoice.payment_succeeded" => {
            let invoice: RawInvoice = serde_json::from_value(object).map_err(malformed)?;
            let period = invoice.line_period();
            GatewayEvent::PaymentSucceeded {
                invoice_id: invoice.id,
                subscription_id: invoice.subscription.map(ExternalSubscriptionId::new),
                amount_paid: invoice.amount_paid,
                period,
            }
        }
        "invoice.payment_failed" => {
            let invoice: RawInvoice = serde_json::from_value(object).map_err(malformed)?;
            GatewayEvent::PaymentFailed {
                invoice_id: invoice.id,
                subscription_id: invoice.subscription.map(ExternalSubscriptionId::new),
                attempt_count: invoice.attempt_count,
            }
        }
        other => GatewayEvent::Ignored {
            event_type: other.to_string(),
        },
    };
    Ok(event)
}

#[derive(Debug, Deserialize)]
struct RawStripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
    created: i64,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawCheckoutSession {
    id: String,
    customer: Option<String>,
    subscription: Option<String>,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawInvoice {
    id: String,
    subscription: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    attempt_count: u32,
    lines: Option<RawInvoiceLines>,
}

#[derive(Debug, Deserialize)]
struct RawInvoiceLines {
    #[serde(default)]
    data: Vec<RawInvoiceLine>,
}

#[derive(Debug, Deserialize)]
struct RawInvoiceLine {
    period: Option<RawPeriod>,
}

#[derive(Debug, Deserialize)]
struct RawPeriod {
    start: i64,
    end: i64,
}

impl RawInvoice {
    fn line_period(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let period = self.lines.as_ref()?.data.first()?.period.as_ref()?;
        let start = Utc.timestamp_opt(period.start, 0).single()?;
        let end = Utc.timestamp_opt(period.end, 0).single()?;
        Some((start, end))
    }
}
