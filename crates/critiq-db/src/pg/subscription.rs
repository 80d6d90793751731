//! PostgreSQL subscription repository implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use critiq_types::{ExternalSubscriptionId, Subscription, SubscriptionId, UserId};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::{DbError, DbResult};
use crate::models::SubscriptionRow;
use crate::repo::SubscriptionRepository;

const COLUMNS: &str = "id, user_id, plan_id, status, current_period_start, current_period_end, \
     trial_start, trial_end, cancel_at_period_end, canceled_at, customer_id, \
     external_subscription_id, external_price_id, metadata, version, created_at, updated_at";

/// PostgreSQL subscription repository
#[derive(Clone)]
pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    /// Create a new subscription repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_many(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, SubscriptionRow, sqlx::postgres::PgArguments>,
    ) -> DbResult<Vec<Subscription>> {
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Subscription::try_from)
            .collect()
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn find_by_id(&self, id: SubscriptionId) -> DbResult<Option<Subscription>> {
        let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE id = $1");
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn find_current_by_user_id(&self, user_id: UserId) -> DbResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND status IN ('trialing', 'active', 'past_due') \
             ORDER BY created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn find_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
    ) -> DbResult<Option<Subscription>> {
        let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE external_subscription_id = $1");
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(external_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn find_latest_terminal_paid_by_user_id(
        &self,
        user_id: UserId,
    ) -> DbResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE user_id = $1 \
               AND status IN ('canceled', 'unpaid', 'incomplete_expired') \
               AND external_subscription_id IS NOT NULL \
             ORDER BY COALESCE(canceled_at, updated_at) DESC LIMIT 1"
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn list_by_user_id(&self, user_id: UserId) -> DbResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC"
        );
        self.fetch_many(sqlx::query_as::<_, SubscriptionRow>(&sql).bind(user_id.0))
            .await
    }

    async fn insert(&self, sub: &Subscription) -> DbResult<Subscription> {
        // Uniqueness of the current subscription per user is enforced by the
        // partial unique index `subscriptions_one_current_per_user`.
        let sql = format!(
            "INSERT INTO subscriptions (id, user_id, plan_id, status, current_period_start, \
                 current_period_end, trial_start, trial_end, cancel_at_period_end, canceled_at, \
                 customer_id, external_subscription_id, external_price_id, metadata, version, \
                 created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(sub.id.0)
            .bind(sub.user_id.0)
            .bind(sub.plan_id.0)
            .bind(sub.status.as_str())
            .bind(sub.current_period_start)
            .bind(sub.current_period_end)
            .bind(sub.trial_start)
            .bind(sub.trial_end)
            .bind(sub.cancel_at_period_end)
            .bind(sub.canceled_at)
            .bind(sub.customer_id.as_ref().map(|c| c.as_str()))
            .bind(sub.external_subscription_id.as_ref().map(|s| s.as_str()))
            .bind(sub.external_price_id.as_ref().map(|p| p.as_str()))
            .bind(Json(&sub.metadata))
            .bind(sub.version)
            .bind(sub.created_at)
            .bind(sub.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from_write)?;

        Subscription::try_from(row)
    }

    async fn update(&self, sub: &Subscription) -> DbResult<Subscription> {
        let sql = format!(
            "UPDATE subscriptions SET \
                 plan_id = $3, status = $4, current_period_start = $5, current_period_end = $6, \
                 trial_start = $7, trial_end = $8, cancel_at_period_end = $9, canceled_at = $10, \
                 customer_id = $11, external_subscription_id = $12, external_price_id = $13, \
                 metadata = $14, version = version + 1, updated_at = $15 \
             WHERE id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(sub.id.0)
            .bind(sub.version)
            .bind(sub.plan_id.0)
            .bind(sub.status.as_str())
            .bind(sub.current_period_start)
            .bind(sub.current_period_end)
            .bind(sub.trial_start)
            .bind(sub.trial_end)
            .bind(sub.cancel_at_period_end)
            .bind(sub.canceled_at)
            .bind(sub.customer_id.as_ref().map(|c| c.as_str()))
            .bind(sub.external_subscription_id.as_ref().map(|s| s.as_str()))
            .bind(sub.external_price_id.as_ref().map(|p| p.as_str()))
            .bind(Json(&sub.metadata))
            .bind(sub.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from_write)?;

        match row {
            Some(row) => Subscription::try_from(row),
            None => Err(DbError::Conflict(format!(
                "subscription {} changed since version {}",
                sub.id, sub.version
            ))),
        }
    }

    async fn list_current_ending_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE status IN ('trialing', 'active', 'past_due') AND current_period_end < $1 \
             ORDER BY current_period_end ASC LIMIT $2"
        );
        self.fetch_many(
            sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(cutoff)
                .bind(limit),
        )
        .await
    }

    async fn list_past_due_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE status = 'past_due' \
               AND (metadata->>'first_past_due_at')::timestamptz < $1 \
             ORDER BY (metadata->>'first_past_due_at')::timestamptz ASC LIMIT $2"
        );
        self.fetch_many(
            sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(cutoff)
                .bind(limit),
        )
        .await
    }
}
