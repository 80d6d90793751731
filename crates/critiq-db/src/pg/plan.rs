//! PostgreSQL plan repository implementation

use async_trait::async_trait;
use critiq_types::{Plan, PlanId, PriceId};
use sqlx::PgPool;

use crate::error::DbResult;
use crate::models::PlanRow;
use crate::repo::PlanRepository;

/// PostgreSQL plan repository
#[derive(Clone)]
pub struct PgPlanRepository {
    pool: PgPool,
}

impl PgPlanRepository {
    /// Create a new plan repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanRepository for PgPlanRepository {
    async fn find_by_id(&self, id: PlanId) -> DbResult<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT id, name, plan_type, price_cents, currency, billing_interval,
                   billing_interval_count, trial_period_days, features, max_products,
                   external_price_id, external_product_id, is_active, created_at
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::try_from).transpose()
    }

    async fn find_by_price_id(&self, price_id: &PriceId) -> DbResult<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT id, name, plan_type, price_cents, currency, billing_interval,
                   billing_interval_count, trial_period_days, features, max_products,
                   external_price_id, external_product_id, is_active, created_at
            FROM plans
            WHERE external_price_id = $1
            "#,
        )
        .bind(price_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::try_from).transpose()
    }

    async fn find_free_plan(&self) -> DbResult<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT id, name, plan_type, price_cents, currency, billing_interval,
                   billing_interval_count, trial_period_days, features, max_products,
                   external_price_id, external_product_id, is_active, created_at
            FROM plans
            WHERE plan_type = 'free' AND is_active
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::try_from).transpose()
    }
}
