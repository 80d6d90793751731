//! PostgreSQL billing account repository implementation
//!
//! Accounts are a billing view over the `users` table.

use async_trait::async_trait;
use critiq_types::{BillingAccount, CustomerId, UserId};
use sqlx::PgPool;

use crate::error::{DbError, DbResult};
use crate::models::AccountRow;
use crate::repo::AccountRepository;

/// PostgreSQL account repository
#[derive(Clone)]
pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    /// Create a new account repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn find_by_id(&self, user_id: UserId) -> DbResult<Option<BillingAccount>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT id, email, name, stripe_customer_id
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BillingAccount::from))
    }

    async fn find_by_customer_id(
        &self,
        customer_id: &CustomerId,
    ) -> DbResult<Option<BillingAccount>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT id, email, name, stripe_customer_id
            FROM users
            WHERE stripe_customer_id = $1
            "#,
        )
        .bind(customer_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BillingAccount::from))
    }

    async fn set_customer_id(&self, user_id: UserId, customer_id: &CustomerId) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET stripe_customer_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id.0)
        .bind(customer_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::from_write)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}
