//! Plan catalog
//!
//! Read-only lookup over published plans. Pricing terms never change once a
//! plan is referenced, so resolved plans are cached for the life of the
//! process. Retirement does change, so purchase lookups always re-read the
//! row.

use std::sync::Arc;

use critiq_db::PlanRepository;
use critiq_types::{Plan, PlanId, PriceId};
use dashmap::DashMap;

use crate::error::BillingError;

/// Cached plan lookup
#[derive(Clone)]
pub struct PlanCatalog {
    plans: Arc<dyn PlanRepository>,
    cache: Arc<DashMap<PlanId, Plan>>,
}

impl PlanCatalog {
    pub fn new(plans: Arc<dyn PlanRepository>) -> Self {
        Self {
            plans,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Resolve a plan for purchase. Inactive plans are rejected.
    pub async fn get(&self, id: PlanId) -> Result<Plan, BillingError> {
        let plan = self.load(id).await?;
        if !plan.is_active {
            return Err(BillingError::PlanNotActive(id));
        }
        Ok(plan)
    }

    /// Resolve a plan a subscription already references, active or not
    pub async fn get_any(&self, id: PlanId) -> Result<Plan, BillingError> {
        if let Some(plan) = self.cache.get(&id) {
            return Ok(plan.value().clone());
        }
        self.load(id).await
    }

    async fn load(&self, id: PlanId) -> Result<Plan, BillingError> {
        let plan = self
            .plans
            .find_by_id(id)
            .await?
            .ok_or(BillingError::PlanNotFound)?;
        self.cache.insert(id, plan.clone());
        Ok(plan)
    }

    /// Plan published under a gateway price
    pub async fn find_by_price(&self, price_id: &PriceId) -> Result<Option<Plan>, BillingError> {
        if let Some(plan) = self
            .cache
            .iter()
            .find(|p| p.external_price_id.as_ref() == Some(price_id))
        {
            return Ok(Some(plan.value().clone()));
        }
        let plan = self.plans.find_by_price_id(price_id).await?;
        if let Some(plan) = &plan {
            self.cache.insert(plan.id, plan.clone());
        }
        Ok(plan)
    }

    /// The free tier every vendor falls back to
    pub async fn free_plan(&self) -> Result<Plan, BillingError> {
        self.plans
            .find_free_plan()
            .await?
            .ok_or(BillingError::PlanNotFound)
    }
}

impl std::fmt::Debug for PlanCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCatalog")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
