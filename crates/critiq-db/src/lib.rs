//! Critiq DB - Persistence layer
//!
//! SQLx-backed repositories for plans, subscriptions and billing accounts,
//! plus in-memory implementations with the same write semantics.
//!
//! # Example
//!
//! ```rust,ignore
//! use critiq_db::{create_pool, run_migrations, Repositories};
//!
//! let pool = create_pool("postgres://localhost/critiq").await?;
//! run_migrations(&pool).await?;
//! let stores = Repositories::new(pool).stores();
//!
//! let current = stores.subscriptions.find_current_by_user_id(user_id).await?;
//! ```

pub mod error;
pub mod memory;
pub mod models;
pub mod pg;
pub mod pool;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryRepositories;
pub use models::*;
pub use pg::Repositories;
pub use pool::{create_pool, create_pool_with_options, run_migrations, DbPool, PoolOptions};
pub use repo::*;
