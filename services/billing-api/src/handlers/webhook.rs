//! Stripe webhook handler

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use critiq_billing_core::BillingError;
use serde::Serialize;
use std::time::Instant;

use crate::handlers::shared::record_op_duration;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// POST /webhooks/stripe
///
/// Only an unverifiable delivery gets a non-2xx answer. Everything past the
/// signature check is acknowledged, failures included.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, StatusCode> {
    let start = Instant::now();

    // Extract Stripe signature header
    let Some(sig_header) = headers.get("stripe-signature") else {
        tracing::warn!("Missing Stripe-Signature header");
        return Err(reject(start));
    };

    let Ok(signature) = sig_header.to_str() else {
        tracing::warn!("Invalid Stripe-Signature header encoding");
        return Err(reject(start));
    };

    match state.billing.handle_webhook(&body, signature).await {
        Ok(outcome) => {
            tracing::debug!(outcome = ?outcome, "Webhook processed");
            record_op_duration("process_webhook", start, true);
        }
        Err(BillingError::InvalidSignature(reason)) => {
            tracing::warn!(reason = %reason, "Webhook signature rejected");
            return Err(reject(start));
        }
        Err(e) => {
            tracing::error!(error = %e, code = e.error_code(), "Webhook processing failed");
            record_op_duration("process_webhook", start, false);
        }
    }

    Ok(Json(WebhookAck { received: true }))
}

fn reject(start: Instant) -> StatusCode {
    metrics::counter!(
        "billing_webhooks_processed_total",
        "event" => "unverified",
        "status" => "rejected"
    )
    .increment(1);
    record_op_duration("process_webhook", start, false);
    StatusCode::BAD_REQUEST
}
