//! Plan types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ParseEnumError, PriceId, ProductId};

/// Unique plan identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    /// Create a new random plan ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a plan ID from a string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Purchasable tier levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    /// Free tier - default for every vendor account
    Free,
    /// Basic paid tier
    Basic,
    /// Standard paid tier
    Standard,
    /// Premium paid tier
    Premium,
}

impl PlanType {
    /// Wire/storage representation
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }

    /// Whether this tier is billed through the gateway
    pub const fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            _ => Err(ParseEnumError::new("plan type", s)),
        }
    }
}

/// Billing cadence unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    /// Wire/storage representation (matches the gateway's interval names)
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(ParseEnumError::new("billing interval", s)),
        }
    }
}

/// A purchasable plan.
///
/// Plans are immutable once a subscription references them. Changing the
/// price of a tier means publishing a new plan and migrating subscriptions
/// to its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan ID
    pub id: PlanId,
    /// Human readable name
    pub name: String,
    /// Tier
    pub plan_type: PlanType,
    /// Price in minor currency units (cents)
    pub price_cents: i64,
    /// ISO currency code, lowercase (e.g. "usd")
    pub currency: String,
    /// Billing cadence unit
    pub billing_interval: BillingInterval,
    /// Number of `billing_interval` units per period (>= 1)
    pub billing_interval_count: u32,
    /// Trial length in days (0 = no trial)
    pub trial_period_days: u32,
    /// Feature flags unlocked by this plan
    pub features: Vec<String>,
    /// Maximum number of listed products (None = unlimited)
    pub max_products: Option<u32>,
    /// Gateway price handle (None for free plans)
    pub external_price_id: Option<PriceId>,
    /// Gateway product handle (None for free plans)
    pub external_product_id: Option<ProductId>,
    /// Inactive plans can no longer be purchased
    pub is_active: bool,
    /// When the plan was published
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Whether the plan has a trial period
    pub fn has_trial(&self) -> bool {
        self.trial_period_days > 0
    }

    /// Whether this is the free tier
    pub fn is_free(&self) -> bool {
        !self.plan_type.is_paid()
    }

    /// Check whether the plan includes a feature
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}
