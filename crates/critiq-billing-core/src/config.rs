//! Billing configuration

use std::time::Duration;

/// Billing engine configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Stripe secret key
    pub stripe_secret_key: String,
    /// Stripe webhook secret
    pub stripe_webhook_secret: String,
    /// Maximum age of a webhook signature timestamp, in seconds
    pub webhook_tolerance_secs: i64,
    /// Consecutive payment failures that trigger a downgrade
    pub payment_failure_threshold: u32,
    /// How long a subscription may stay past due before the sweep downgrades it
    pub past_due_grace: chrono::Duration,
    /// How long after cancellation a subscription can still be reactivated
    pub reactivation_window: chrono::Duration,
    /// Conditional-write attempts before giving up on a contended record
    pub max_write_attempts: u32,
    /// Bound on every individual gateway call
    pub gateway_timeout: Duration,
    /// Records loaded per sweep query
    pub sweep_batch_size: i64,
    /// Checkout success redirect
    pub success_url: String,
    /// Checkout cancel redirect
    pub cancel_url: String,
    /// Billing settings page, used as the redirect hint for payment problems
    pub settings_url: String,
}

impl BillingConfig {
    /// Create a new billing config with default policy values
    pub fn new(
        stripe_secret_key: impl Into<String>,
        stripe_webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            stripe_secret_key: stripe_secret_key.into(),
            stripe_webhook_secret: stripe_webhook_secret.into(),
            webhook_tolerance_secs: 300,
            payment_failure_threshold: 3,
            past_due_grace: chrono::Duration::days(7),
            reactivation_window: chrono::Duration::days(30),
            max_write_attempts: 5,
            gateway_timeout: Duration::from_secs(10),
            sweep_batch_size: 500,
            success_url: "https://app.critiq.io/billing/success".to_string(),
            cancel_url: "https://app.critiq.io/billing/cancel".to_string(),
            settings_url: "https://app.critiq.io/settings/billing".to_string(),
        }
    }

    /// Set the consecutive failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.payment_failure_threshold = threshold.max(1);
        self
    }

    /// Set the past-due grace window in days
    pub fn with_past_due_grace_days(mut self, days: i64) -> Self {
        self.past_due_grace = chrono::Duration::days(days);
        self
    }

    /// Set the reactivation window in days
    pub fn with_reactivation_window_days(mut self, days: i64) -> Self {
        self.reactivation_window = chrono::Duration::days(days);
        self
    }

    /// Set the gateway call timeout
    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    /// Set the conditional-write attempt budget
    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    /// Set checkout redirect URLs
    pub fn with_urls(
        mut self,
        success_url: impl Into<String>,
        cancel_url: impl Into<String>,
    ) -> Self {
        self.success_url = success_url.into();
        self.cancel_url = cancel_url.into();
        self
    }

    /// Set the billing settings URL
    pub fn with_settings_url(mut self, url: impl Into<String>) -> Self {
        self.settings_url = url.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let config = BillingConfig::new("sk_test", "whsec_test");
        assert_eq!(config.payment_failure_threshold, 3);
        assert_eq!(config.past_due_grace, chrono::Duration::days(7));
        assert_eq!(config.reactivation_window, chrono::Duration::days(30));
        assert_eq!(config.webhook_tolerance_secs, 300);
    }

    #[test]
    fn test_builder_clamps_zero() {
        let config = BillingConfig::new("sk", "wh")
            .with_failure_threshold(0)
            .with_max_write_attempts(0);
        assert_eq!(config.payment_failure_threshold, 1);
        assert_eq!(config.max_write_attempts, 1);
    }
}
