//! Billing errors

use critiq_db::DbError;
use critiq_types::PlanId;
use serde::Serialize;
use thiserror::Error;

/// Errors reported by a payment gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The card was declined
    #[error("card declined: {message}")]
    CardDeclined {
        message: String,
        decline_code: Option<String>,
    },

    /// The customer has no usable payment method
    #[error("no usable payment method on file")]
    NoPaymentMethod,

    /// The gateway rejected the request as malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The referenced gateway object does not exist
    #[error("resource missing: {0}")]
    ResourceMissing(String),

    /// The call did not complete within the configured bound
    #[error("gateway call timed out")]
    Timeout,

    /// Network failure before a response arrived
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other non-success response
    #[error("gateway error {status}: {message}")]
    Api { status: u16, message: String },
}

impl GatewayError {
    /// Whether repeating the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// What the caller should do to recover from a failed billing action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    /// Add a payment method, then retry
    AddPaymentMethod,
    /// Replace the payment method that was declined
    UpdatePaymentMethod,
    /// Start a fresh checkout
    StartCheckout,
}

/// Remediation hint attached to checkout and reactivation failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Remediation {
    pub action: RemediationAction,
    pub redirect_url: Option<String>,
}

/// Past the reactivation window the only way back is a new checkout
static START_CHECKOUT: Remediation = Remediation {
    action: RemediationAction::StartCheckout,
    redirect_url: None,
};

impl Remediation {
    pub fn new(action: RemediationAction, redirect_url: impl Into<String>) -> Self {
        Self {
            action,
            redirect_url: Some(redirect_url.into()),
        }
    }
}

/// Billing errors
#[derive(Error, Debug)]
pub enum BillingError {
    /// Input failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// User not found
    #[error("user not found")]
    UserNotFound,

    /// Plan not found
    #[error("plan not found")]
    PlanNotFound,

    /// Subscription not found
    #[error("subscription not found")]
    SubscriptionNotFound,

    /// Plan exists but is not offered any more
    #[error("plan {0} is not active")]
    PlanNotActive(PlanId),

    /// Duplicate current subscription or a write that kept losing races
    #[error("conflict: {0}")]
    Conflict(String),

    /// Payment gateway failure
    #[error("gateway error: {source}")]
    Gateway {
        #[source]
        source: GatewayError,
        remediation: Option<Remediation>,
    },

    /// Subscription cannot be reactivated
    #[error("subscription cannot be reactivated: {0}")]
    NotReactivatable(String),

    /// Subscription is active with no pending cancellation
    #[error("subscription is already active")]
    AlreadyActive,

    /// Webhook authenticity check failed
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),

    /// Database error
    #[error("database error: {0}")]
    Database(DbError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DbError> for BillingError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Database(other),
        }
    }
}

impl From<GatewayError> for BillingError {
    fn from(source: GatewayError) -> Self {
        Self::Gateway {
            source,
            remediation: None,
        }
    }
}

impl BillingError {
    /// Gateway failure with a remediation hint derived from its kind
    pub fn gateway(source: GatewayError, settings_url: &str) -> Self {
        let remediation = match source {
            GatewayError::NoPaymentMethod => Some(Remediation::new(
                RemediationAction::AddPaymentMethod,
                settings_url,
            )),
            GatewayError::CardDeclined { .. } => Some(Remediation::new(
                RemediationAction::UpdatePaymentMethod,
                settings_url,
            )),
            _ => None,
        };
        Self::Gateway {
            source,
            remediation,
        }
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::PlanNotFound => "PLAN_NOT_FOUND",
            Self::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            Self::PlanNotActive(_) => "PLAN_NOT_ACTIVE",
            Self::Conflict(_) => "CONFLICT",
            Self::Gateway { source, .. } => match source {
                GatewayError::CardDeclined { .. } => "CARD_DECLINED",
                GatewayError::NoPaymentMethod => "NO_PAYMENT_METHOD",
                GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
                GatewayError::ResourceMissing(_) => "GATEWAY_RESOURCE_MISSING",
                GatewayError::Timeout | GatewayError::Transport(_) | GatewayError::Api { .. } => {
                    "GATEWAY_UNAVAILABLE"
                }
            },
            Self::NotReactivatable(_) => "NOT_REACTIVATABLE",
            Self::AlreadyActive => "ALREADY_ACTIVE",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Recovery hint, when one exists
    pub fn remediation(&self) -> Option<&Remediation> {
        match self {
            Self::Gateway { remediation, .. } => remediation.as_ref(),
            Self::NotReactivatable(_) => Some(&START_CHECKOUT),
            _ => None,
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UserNotFound | Self::PlanNotFound | Self::SubscriptionNotFound
        )
    }

    /// Check if this is a gateway error
    pub fn is_gateway_error(&self) -> bool {
        matches!(self, Self::Gateway { .. })
    }

    /// Check if this is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Notification delivery errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),

    #[error("notification endpoint returned {0}")]
    Rejected(u16),
}
