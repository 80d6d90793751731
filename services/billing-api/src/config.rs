//! Configuration for the Billing API service.

use critiq_billing_core::BillingConfig;
use std::str::FromStr;
use std::time::Duration;

/// Billing API configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port
    pub http_port: u16,
    /// Database URL
    pub database_url: String,
    /// Billing core configuration
    pub billing: BillingConfig,
    /// Request timeout
    pub request_timeout: Duration,
    /// Expired-period sweep cadence
    pub primary_sweep_interval: Duration,
    /// Stale past-due sweep cadence
    pub secondary_sweep_interval: Duration,
    /// Notification webhook; messages are only logged when unset
    pub notify_webhook_url: Option<String>,
    /// Metrics enabled
    pub metrics_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Database
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let http_port = parse_or("HTTP_PORT", 8081u16)?;

        // Stripe configuration
        let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| ConfigError::Missing("STRIPE_SECRET_KEY"))?;

        let stripe_webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?;

        let defaults = BillingConfig::new("", "");

        // Redirect targets
        let success_url =
            std::env::var("BILLING_SUCCESS_URL").unwrap_or_else(|_| defaults.success_url.clone());
        let cancel_url =
            std::env::var("BILLING_CANCEL_URL").unwrap_or_else(|_| defaults.cancel_url.clone());
        let settings_url = std::env::var("BILLING_SETTINGS_URL")
            .unwrap_or_else(|_| defaults.settings_url.clone());

        // Lifecycle policy
        let failure_threshold = parse_or(
            "PAYMENT_FAILURE_THRESHOLD",
            defaults.payment_failure_threshold,
        )?;
        let grace_days = parse_or("PAST_DUE_GRACE_DAYS", defaults.past_due_grace.num_days())?;
        let window_days = parse_or(
            "REACTIVATION_WINDOW_DAYS",
            defaults.reactivation_window.num_days(),
        )?;
        let gateway_timeout_secs =
            parse_or("GATEWAY_TIMEOUT_SECS", defaults.gateway_timeout.as_secs())?;

        // Request timeout
        let request_timeout_secs: u64 = parse_or("REQUEST_TIMEOUT_SECS", 30)?;

        // Sweeps
        let primary_secs: u64 = parse_or("PRIMARY_SWEEP_INTERVAL_SECS", 86_400)?;
        let secondary_secs: u64 = parse_or("SECONDARY_SWEEP_INTERVAL_SECS", 3_600)?;
        if primary_secs == 0 {
            return Err(ConfigError::Invalid("PRIMARY_SWEEP_INTERVAL_SECS"));
        }
        if secondary_secs == 0 {
            return Err(ConfigError::Invalid("SECONDARY_SWEEP_INTERVAL_SECS"));
        }

        let notify_webhook_url = std::env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        // Metrics
        let metrics_enabled = std::env::var("METRICS_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        // Build billing config
        let billing = BillingConfig::new(&stripe_secret_key, &stripe_webhook_secret)
            .with_urls(&success_url, &cancel_url)
            .with_settings_url(&settings_url)
            .with_failure_threshold(failure_threshold)
            .with_past_due_grace_days(grace_days)
            .with_reactivation_window_days(window_days)
            .with_gateway_timeout(Duration::from_secs(gateway_timeout_secs));

        Ok(Self {
            http_port,
            database_url,
            billing,
            request_timeout: Duration::from_secs(request_timeout_secs),
            primary_sweep_interval: Duration::from_secs(primary_secs),
            secondary_sweep_interval: Duration::from_secs(secondary_secs),
            notify_webhook_url,
            metrics_enabled,
        })
    }
}

/// Read `name` as a `T`, falling back to `default` when unset
fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
