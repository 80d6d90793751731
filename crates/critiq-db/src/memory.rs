//! In-memory repository implementations
//!
//! DashMap-backed stores with the same conditional write rules as the
//! PostgreSQL repositories: one current subscription per user, one record per
//! gateway subscription, and version-checked updates. Used by tests and by
//! local runs without a database.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use critiq_types::{
    BillingAccount, CustomerId, ExternalSubscriptionId, Plan, PlanId, PlanType, PriceId,
    Subscription, SubscriptionId, SubscriptionStatus, UserId,
};
use dashmap::DashMap;

use crate::error::{DbError, DbResult};
use crate::repo::{AccountRepository, PlanRepository, Stores, SubscriptionRepository};

/// In-memory plan repository
#[derive(Default, Clone)]
pub struct MemoryPlanRepository {
    plans: Arc<DashMap<PlanId, Plan>>,
}

impl MemoryPlanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a plan directly
    pub fn put(&self, plan: Plan) {
        self.plans.insert(plan.id, plan);
    }
}

#[async_trait]
impl PlanRepository for MemoryPlanRepository {
    async fn find_by_id(&self, id: PlanId) -> DbResult<Option<Plan>> {
        Ok(self.plans.get(&id).map(|r| r.value().clone()))
    }

    async fn find_by_price_id(&self, price_id: &PriceId) -> DbResult<Option<Plan>> {
        Ok(self
            .plans
            .iter()
            .find(|r| r.external_price_id.as_ref() == Some(price_id))
            .map(|r| r.value().clone()))
    }

    async fn find_free_plan(&self) -> DbResult<Option<Plan>> {
        Ok(self
            .plans
            .iter()
            .filter(|r| r.plan_type == PlanType::Free && r.is_active)
            .min_by_key(|r| r.created_at)
            .map(|r| r.value().clone()))
    }
}

/// In-memory subscription repository
#[derive(Default, Clone)]
pub struct MemorySubscriptionRepository {
    subscriptions: Arc<DashMap<SubscriptionId, Subscription>>,
    // Serializes writes so uniqueness checks and the write itself are atomic.
    write_gate: Arc<Mutex<()>>,
}

impl MemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, in no particular order
    pub fn all(&self) -> Vec<Subscription> {
        self.subscriptions.iter().map(|r| r.value().clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_for(&self, user_id: UserId) -> Option<Subscription> {
        self.subscriptions
            .iter()
            .filter(|r| r.user_id == user_id && r.is_current())
            .max_by_key(|r| r.created_at)
            .map(|r| r.value().clone())
    }

    fn check_unique(&self, sub: &Subscription) -> DbResult<()> {
        for existing in self.subscriptions.iter() {
            if existing.id == sub.id {
                continue;
            }
            if sub.is_current() && existing.user_id == sub.user_id && existing.is_current() {
                return Err(DbError::Conflict(format!(
                    "user {} already has current subscription {}",
                    sub.user_id, existing.id
                )));
            }
            if sub.external_subscription_id.is_some()
                && existing.external_subscription_id == sub.external_subscription_id
            {
                return Err(DbError::Conflict(format!(
                    "gateway subscription already recorded as {}",
                    existing.id
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for MemorySubscriptionRepository {
    async fn find_by_id(&self, id: SubscriptionId) -> DbResult<Option<Subscription>> {
        Ok(self.subscriptions.get(&id).map(|r| r.value().clone()))
    }

    async fn find_current_by_user_id(&self, user_id: UserId) -> DbResult<Option<Subscription>> {
        Ok(self.current_for(user_id))
    }

    async fn find_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
    ) -> DbResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .find(|r| r.external_subscription_id.as_ref() == Some(external_id))
            .map(|r| r.value().clone()))
    }

    async fn find_latest_terminal_paid_by_user_id(
        &self,
        user_id: UserId,
    ) -> DbResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|r| r.user_id == user_id && r.status.is_terminal() && r.is_external())
            .max_by_key(|r| r.canceled_at.unwrap_or(r.updated_at))
            .map(|r| r.value().clone()))
    }

    async fn list_by_user_id(&self, user_id: UserId) -> DbResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn insert(&self, sub: &Subscription) -> DbResult<Subscription> {
        let _gate = self.lock();
        if self.subscriptions.contains_key(&sub.id) {
            return Err(DbError::Conflict(format!("subscription {} exists", sub.id)));
        }
        self.check_unique(sub)?;
        self.subscriptions.insert(sub.id, sub.clone());
        Ok(sub.clone())
    }

    async fn update(&self, sub: &Subscription) -> DbResult<Subscription> {
        let _gate = self.lock();
        let stored_version = match self.subscriptions.get(&sub.id) {
            Some(stored) => stored.version,
            None => return Err(DbError::NotFound),
        };
        if stored_version != sub.version {
            return Err(DbError::Conflict(format!(
                "subscription {} changed since version {}",
                sub.id, sub.version
            )));
        }
        self.check_unique(sub)?;

        let mut next = sub.clone();
        next.version = sub.version + 1;
        self.subscriptions.insert(next.id, next.clone());
        Ok(next)
    }

    async fn list_current_ending_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|r| r.is_current() && r.current_period_end < cutoff)
            .map(|r| r.value().clone())
            .collect();
        subs.sort_by_key(|s| s.current_period_end);
        subs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(subs)
    }

    async fn list_past_due_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|r| {
                r.status == SubscriptionStatus::PastDue
                    && r.metadata.first_past_due_at.is_some_and(|t| t < cutoff)
            })
            .map(|r| r.value().clone())
            .collect();
        subs.sort_by_key(|s| s.metadata.first_past_due_at);
        subs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(subs)
    }
}

/// In-memory account repository
#[derive(Default, Clone)]
pub struct MemoryAccountRepository {
    accounts: Arc<DashMap<UserId, BillingAccount>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an account directly
    pub fn put(&self, account: BillingAccount) {
        self.accounts.insert(account.user_id, account);
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn find_by_id(&self, user_id: UserId) -> DbResult<Option<BillingAccount>> {
        Ok(self.accounts.get(&user_id).map(|r| r.value().clone()))
    }

    async fn find_by_customer_id(
        &self,
        customer_id: &CustomerId,
    ) -> DbResult<Option<BillingAccount>> {
        Ok(self
            .accounts
            .iter()
            .find(|r| r.customer_id.as_ref() == Some(customer_id))
            .map(|r| r.value().clone()))
    }

    async fn set_customer_id(&self, user_id: UserId, customer_id: &CustomerId) -> DbResult<()> {
        match self.accounts.get_mut(&user_id) {
            Some(mut account) => {
                account.customer_id = Some(customer_id.clone());
                Ok(())
            }
            None => Err(DbError::NotFound),
        }
    }
}

/// In-memory repositories bundled together
#[derive(Default, Clone)]
pub struct MemoryRepositories {
    pub plans: MemoryPlanRepository,
    pub subscriptions: MemorySubscriptionRepository,
    pub accounts: MemoryAccountRepository,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Type-erased handles sharing this bundle's state
    pub fn stores(&self) -> Stores {
        Stores {
            plans: Arc::new(self.plans.clone()),
            subscriptions: Arc::new(self.subscriptions.clone()),
            accounts: Arc::new(self.accounts.clone()),
        }
    }
}
