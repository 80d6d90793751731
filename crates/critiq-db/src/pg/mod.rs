//! PostgreSQL repository implementations

mod account;
mod plan;
mod subscription;

pub use account::PgAccountRepository;
pub use plan::PgPlanRepository;
pub use subscription::PgSubscriptionRepository;

use std::sync::Arc;

use crate::repo::Stores;
use crate::DbPool;

/// All repositories bundled together
#[derive(Clone)]
pub struct Repositories {
    pub plans: PgPlanRepository,
    pub subscriptions: PgSubscriptionRepository,
    pub accounts: PgAccountRepository,
}

impl Repositories {
    /// Create all repositories from a database pool
    pub fn new(pool: DbPool) -> Self {
        Self {
            plans: PgPlanRepository::new(pool.clone()),
            subscriptions: PgSubscriptionRepository::new(pool.clone()),
            accounts: PgAccountRepository::new(pool),
        }
    }

    /// Type-erased handles for the billing engine
    pub fn stores(&self) -> Stores {
        Stores {
            plans: Arc::new(self.plans.clone()),
            subscriptions: Arc::new(self.subscriptions.clone()),
            accounts: Arc::new(self.accounts.clone()),
        }
    }
}
