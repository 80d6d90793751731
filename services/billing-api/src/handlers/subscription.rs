//! Subscription handlers

use axum::extract::{Path, State};
use axum::Json;
use critiq_billing_core::{Reactivation, SubscriptionView};
use critiq_types::Subscription;
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::handlers::shared::{parse_plan_id, parse_user_id, timed};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub user_id: String,
    pub plan_id: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
    #[serde(default = "default_at_period_end")]
    pub at_period_end: bool,
}

fn default_at_period_end() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub user_id: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/billing/subscription/{user_id}
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<SubscriptionView>> {
    timed("get_subscription", async {
        let user_id = parse_user_id(&user_id)?;
        Ok(Json(state.billing.get_subscription(user_id).await?))
    })
    .await
}

/// POST /api/v1/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    timed("create_checkout", async {
        let user_id = parse_user_id(&req.user_id)?;
        let plan_id = parse_plan_id(&req.plan_id)?;

        let session = state.billing.create_checkout(user_id, plan_id).await?;
        tracing::info!(user_id = %user_id, plan_id = %plan_id, "Checkout session created");

        Ok(Json(CheckoutResponse {
            session_id: session.session_id,
            url: session.url,
        }))
    })
    .await
}

/// POST /api/v1/billing/cancel
///
/// Returns the record the user now holds: the paid one with the cancel flag
/// set, or the free one after an immediate cancellation.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<Subscription>> {
    timed("cancel_subscription", async {
        let user_id = parse_user_id(&req.user_id)?;
        let sub = state.billing.cancel(user_id, req.at_period_end).await?;
        Ok(Json(sub))
    })
    .await
}

/// POST /api/v1/billing/reactivate
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Json(req): Json<UserRequest>,
) -> ApiResult<Json<Reactivation>> {
    timed("reactivate_subscription", async {
        let user_id = parse_user_id(&req.user_id)?;
        let reactivation = state.billing.reactivate(user_id).await?;
        tracing::info!(
            user_id = %user_id,
            path = reactivation.path.as_str(),
            "Subscription reactivated"
        );
        Ok(Json(reactivation))
    })
    .await
}

/// POST /api/v1/billing/bootstrap
pub async fn bootstrap_free_tier(
    State(state): State<AppState>,
    Json(req): Json<UserRequest>,
) -> ApiResult<Json<Subscription>> {
    timed("bootstrap_free_tier", async {
        let user_id = parse_user_id(&req.user_id)?;
        Ok(Json(state.billing.bootstrap_free_tier(user_id).await?))
    })
    .await
}
