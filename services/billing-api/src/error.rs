//! Error types for the Billing API service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use critiq_billing_core::{BillingError, GatewayError};
use serde::Serialize;

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        let Self::Billing(err) = self else {
            return StatusCode::BAD_REQUEST;
        };
        match err {
            BillingError::Validation(_) | BillingError::InvalidSignature(_) => {
                StatusCode::BAD_REQUEST
            }
            BillingError::UserNotFound
            | BillingError::PlanNotFound
            | BillingError::SubscriptionNotFound => StatusCode::NOT_FOUND,
            BillingError::Conflict(_) | BillingError::AlreadyActive => StatusCode::CONFLICT,
            BillingError::PlanNotActive(_) | BillingError::NotReactivatable(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            BillingError::Gateway { source, .. } => match source {
                GatewayError::CardDeclined { .. } | GatewayError::NoPaymentMethod => {
                    StatusCode::PAYMENT_REQUIRED
                }
                GatewayError::Timeout | GatewayError::Transport(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                GatewayError::InvalidRequest(_)
                | GatewayError::ResourceMissing(_)
                | GatewayError::Api { .. } => StatusCode::BAD_GATEWAY,
            },
            BillingError::Database(_) | BillingError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Billing(err) => err.error_code(),
        }
    }

    /// Public message; storage and internal faults are not echoed to callers
    fn message(&self) -> String {
        match self {
            Self::Billing(BillingError::Database(_) | BillingError::Internal(_)) => {
                "Internal error".to_string()
            }
            other => other.to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        let Self::Billing(err) = self else {
            return None;
        };
        let remediation = err.remediation()?;
        Some(serde_json::json!({ "remediation": remediation }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = ?self, "Internal API error");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.message(),
                details: self.details(),
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
