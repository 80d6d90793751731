//! Database row models
//!
//! These types map directly to database rows using SQLx's FromRow derive.

use chrono::{DateTime, Utc};
use critiq_types::{
    BillingAccount, BillingInterval, CustomerId, ExternalSubscriptionId, Plan, PlanId, PlanType,
    PriceId, ProductId, Subscription, SubscriptionId, SubscriptionMetadata, SubscriptionStatus,
    UserId,
};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::DbError;

/// Plan row from the database
#[derive(Debug, Clone, FromRow)]
pub struct PlanRow {
    pub id: Uuid,
    pub name: String,
    pub plan_type: String,
    pub price_cents: i64,
    pub currency: String,
    pub billing_interval: String,
    pub billing_interval_count: i32,
    pub trial_period_days: i32,
    pub features: Vec<String>,
    pub max_products: Option<i32>,
    pub external_price_id: Option<String>,
    pub external_product_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Subscription row from the database
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub external_price_id: Option<String>,
    pub metadata: Json<SubscriptionMetadata>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Billing view of a user row
#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub stripe_customer_id: Option<String>,
}

fn non_negative(value: i32, field: &str) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|_| DbError::Corrupt(format!("negative {field}: {value}")))
}

impl TryFrom<PlanRow> for Plan {
    type Error = DbError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        let plan_type: PlanType = row
            .plan_type
            .parse()
            .map_err(|e: critiq_types::ParseEnumError| DbError::Corrupt(e.to_string()))?;
        let billing_interval: BillingInterval = row
            .billing_interval
            .parse()
            .map_err(|e: critiq_types::ParseEnumError| DbError::Corrupt(e.to_string()))?;

        Ok(Self {
            id: PlanId(row.id),
            name: row.name,
            plan_type,
            price_cents: row.price_cents,
            currency: row.currency,
            billing_interval,
            billing_interval_count: non_negative(row.billing_interval_count, "interval count")?,
            trial_period_days: non_negative(row.trial_period_days, "trial days")?,
            features: row.features,
            max_products: row
                .max_products
                .map(|v| non_negative(v, "max products"))
                .transpose()?,
            external_price_id: row.external_price_id.map(PriceId),
            external_product_id: row.external_product_id.map(ProductId),
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = DbError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status: SubscriptionStatus = row
            .status
            .parse()
            .map_err(|e: critiq_types::ParseEnumError| DbError::Corrupt(e.to_string()))?;

        Ok(Self {
            id: SubscriptionId(row.id),
            user_id: UserId(row.user_id),
            plan_id: PlanId(row.plan_id),
            status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            customer_id: row.customer_id.map(CustomerId),
            external_subscription_id: row.external_subscription_id.map(ExternalSubscriptionId),
            external_price_id: row.external_price_id.map(PriceId),
            metadata: row.metadata.0,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<AccountRow> for BillingAccount {
    fn from(row: AccountRow) -> Self {
        Self {
            user_id: UserId(row.id),
            email: row.email,
            name: row.name,
            customer_id: row.stripe_customer_id.map(CustomerId),
        }
    }
}
