//! Payment gateway handles and payment types

use serde::{Deserialize, Serialize};

macro_rules! gateway_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an opaque gateway handle
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw handle
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

gateway_handle!(
    /// Gateway customer handle (e.g. `cus_...`)
    CustomerId
);

gateway_handle!(
    /// Gateway price handle (e.g. `price_...`)
    PriceId
);

gateway_handle!(
    /// Gateway product handle (e.g. `prod_...`)
    ProductId
);

gateway_handle!(
    /// Gateway subscription handle (e.g. `sub_...`)
    ExternalSubscriptionId
);

/// Payment method type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodType {
    /// Credit or debit card
    Card,
    /// Bank account (ACH / SEPA)
    BankAccount,
    /// `PayPal`
    PayPal,
    /// Anything the gateway reports that we do not model
    Other,
}

/// Payment method on file with the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    /// Gateway payment method ID
    pub id: String,
    /// Payment method type
    pub method_type: PaymentMethodType,
    /// Whether this is the default payment method
    pub is_default: bool,
    /// Card brand (if card)
    pub card_brand: Option<String>,
    /// Last 4 digits (if card)
    pub card_last4: Option<String>,
    /// Card expiration month (if card)
    pub card_exp_month: Option<u32>,
    /// Card expiration year (if card)
    pub card_exp_year: Option<u32>,
}

impl PaymentMethod {
    /// Whether the method can be charged as of the given year/month.
    ///
    /// Non-card methods have no expiry and are always usable.
    pub fn is_usable(&self, year: i32, month: u32) -> bool {
        match (self.card_exp_year, self.card_exp_month) {
            (Some(exp_year), Some(exp_month)) => {
                let exp_year = exp_year as i32;
                exp_year > year || (exp_year == year && exp_month >= month)
            }
            _ => true,
        }
    }
}

/// Hosted checkout session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Gateway checkout session ID
    pub session_id: String,
    /// Checkout URL to redirect user to
    pub url: String,
}
