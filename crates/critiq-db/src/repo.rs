//! Repository traits
//!
//! Define async repository interfaces for database operations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use critiq_types::{
    BillingAccount, CustomerId, ExternalSubscriptionId, Plan, PlanId, PriceId, Subscription,
    SubscriptionId, UserId,
};

use crate::error::DbResult;

/// Plan repository trait
#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// Find a plan by ID (active or not)
    async fn find_by_id(&self, id: PlanId) -> DbResult<Option<Plan>>;

    /// Find the plan published with a gateway price
    async fn find_by_price_id(&self, price_id: &PriceId) -> DbResult<Option<Plan>>;

    /// Find the active free plan
    async fn find_free_plan(&self) -> DbResult<Option<Plan>>;
}

/// Subscription repository trait
///
/// Writes are conditional. `insert` rejects a second current subscription
/// for the same user and a second record for the same gateway subscription;
/// `update` only succeeds when the stored version still equals the version
/// of the record passed in. Both report a lost race as `DbError::Conflict`.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Find a subscription by ID
    async fn find_by_id(&self, id: SubscriptionId) -> DbResult<Option<Subscription>>;

    /// Find the user's current (trialing, active or past due) subscription
    async fn find_current_by_user_id(&self, user_id: UserId) -> DbResult<Option<Subscription>>;

    /// Find subscription by gateway subscription ID
    async fn find_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
    ) -> DbResult<Option<Subscription>>;

    /// Find the user's most recently ended gateway-backed subscription
    async fn find_latest_terminal_paid_by_user_id(
        &self,
        user_id: UserId,
    ) -> DbResult<Option<Subscription>>;

    /// All subscriptions for a user, newest first
    async fn list_by_user_id(&self, user_id: UserId) -> DbResult<Vec<Subscription>>;

    /// Insert a new subscription
    async fn insert(&self, sub: &Subscription) -> DbResult<Subscription>;

    /// Compare-and-swap write keyed on `sub.version`.
    ///
    /// Returns the stored record with its version incremented.
    async fn update(&self, sub: &Subscription) -> DbResult<Subscription>;

    /// Current subscriptions whose period ended before `cutoff`
    async fn list_current_ending_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Subscription>>;

    /// Past-due subscriptions whose failure run started before `cutoff`
    async fn list_past_due_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Subscription>>;
}

/// Billing account repository trait
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Find an account by user ID
    async fn find_by_id(&self, user_id: UserId) -> DbResult<Option<BillingAccount>>;

    /// Find an account by gateway customer ID
    async fn find_by_customer_id(&self, customer_id: &CustomerId)
        -> DbResult<Option<BillingAccount>>;

    /// Update the account's gateway customer ID
    async fn set_customer_id(&self, user_id: UserId, customer_id: &CustomerId) -> DbResult<()>;
}

/// Type-erased repository bundle handed to the billing engine
#[derive(Clone)]
pub struct Stores {
    pub plans: Arc<dyn PlanRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub accounts: Arc<dyn AccountRepository>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
