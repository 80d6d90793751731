//! Critiq Billing Core - Subscription lifecycle engine
//!
//! Keeps each vendor's subscription record consistent with the payment
//! gateway across trials, renewals, payment failures, cancellations and
//! reactivations.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use critiq_billing_core::{BillingConfig, BillingService, Outbox, StripeGateway, TimedGateway};
//!
//! let config = BillingConfig::new("sk_test_...", "whsec_...");
//! let gateway = TimedGateway::new(
//!     Arc::new(StripeGateway::new(&config.stripe_secret_key)),
//!     config.gateway_timeout,
//! );
//! let (outbox, receiver) = Outbox::channel();
//! let billing = BillingService::new(repos.stores(), Arc::new(gateway), outbox, config);
//!
//! // Webhook ingress
//! let outcome = billing.handle_webhook(&body, &signature).await?;
//!
//! // Reconciliation
//! let report = billing.sweep_expired(chrono::Utc::now()).await?;
//! ```

pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod machine;
pub mod notify;
pub mod orchestrator;
pub mod period;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod stripe;
pub mod sweep;
pub mod webhook;

pub use catalog::PlanCatalog;
pub use config::BillingConfig;
pub use dispatcher::DispatchOutcome;
pub use error::{BillingError, GatewayError, NotifyError, Remediation, RemediationAction};
pub use gateway::{
    CheckoutRequest, GatewayCustomer, GatewayResult, GatewaySubscription, IdempotencyKey,
    NewCustomer, NewSubscription, PaymentGateway, SubscriptionUpdate, TimedGateway,
};
pub use lifecycle::{Installed, Mutation};
pub use notify::{
    run_notification_worker, Channel, HttpNotifier, LogNotifier, Notice, Notifier,
    OutboundMessage, Outbox, OutboxReceiver, TemplateKind,
};
pub use orchestrator::{Downgrade, Reactivation, ReactivationPath};
pub use retry::RetryConfig;
pub use scheduler::SweepScheduler;
pub use service::{BillingService, SubscriptionView};
pub use stripe::StripeGateway;
pub use sweep::{SweepAction, SweepKind, SweepReport};
pub use webhook::{parse_event, GatewayEvent, WebhookEvent, WebhookVerifier};
