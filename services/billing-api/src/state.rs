//! Application state for the Billing API service.

use critiq_billing_core::BillingService;
use critiq_db::DbPool;
use std::sync::Arc;

use crate::config::Config;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Billing engine
    pub billing: Arc<BillingService>,
    /// Database pool for readiness checks; absent on in-memory stores
    pub pool: Option<DbPool>,
    /// Configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Create new application state
    pub fn new(billing: Arc<BillingService>, pool: Option<DbPool>, config: Config) -> Self {
        Self {
            billing,
            pool,
            config: Arc::new(config),
        }
    }

    /// Get request timeout from config
    pub fn request_timeout(&self) -> std::time::Duration {
        self.config.request_timeout
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
