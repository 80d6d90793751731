//! Critiq Billing API
//!
//! Subscription lifecycle service for review-marketplace vendors.
//!
//! ## REST Endpoints
//!
//! - `GET /api/v1/billing/subscription/{user_id}` - Current subscription and plan
//! - `POST /api/v1/billing/checkout` - Create checkout session
//! - `POST /api/v1/billing/cancel` - Cancel at period end or immediately
//! - `POST /api/v1/billing/reactivate` - Undo a cancellation
//! - `POST /api/v1/billing/bootstrap` - Start a new vendor on the free tier
//! - `POST /webhooks/stripe` - Stripe webhook handler
//!
//! ## Background Tasks
//!
//! - Reconciliation sweeps (expired periods, stale past-due)
//! - Notification delivery from the outbox
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Liveness probe
//! - `GET /ready` - Readiness probe
//! - `GET /metrics` - Prometheus metrics

mod config;
mod error;
mod handlers;
mod state;


use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::IntoMakeServiceWithConnectInfo;
use axum::routing::{get, post};
use axum::Router;
use critiq_billing_core::{
    run_notification_worker, BillingService, HttpNotifier, LogNotifier, Notifier, Outbox,
    RetryConfig, StripeGateway, SweepScheduler, TimedGateway,
};
use critiq_db::Repositories;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::handlers::{health, ready};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("billing_api=debug".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Critiq Billing API");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(
        http_port = config.http_port,
        failure_threshold = config.billing.payment_failure_threshold,
        grace_days = config.billing.past_due_grace.num_days(),
        "Configuration loaded"
    );

    // Initialize metrics
    let metrics_handle = if config.metrics_enabled {
        Some(setup_metrics()?)
    } else {
        None
    };

    // Create database pool
    let pool = critiq_db::create_pool(&config.database_url).await?;
    critiq_db::run_migrations(&pool).await?;
    tracing::info!("Database pool created");

    let repos = Repositories::new(pool.clone());

    // Payment gateway: bounded calls, one retry for reads
    let stripe = StripeGateway::new(&config.billing.stripe_secret_key);
    let gateway = TimedGateway::new(Arc::new(stripe), config.billing.gateway_timeout)
        .with_read_retry(RetryConfig::new().with_max_attempts(1));

    // Notifications are delivered off the request path
    let (outbox, receiver) = Outbox::channel();
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(HttpNotifier::new(url)),
        None => {
            tracing::warn!("NOTIFY_WEBHOOK_URL not set, notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };
    let notification_worker = tokio::spawn(run_notification_worker(receiver, notifier));

    // Create billing service
    let billing = Arc::new(BillingService::new(
        repos.stores(),
        Arc::new(gateway),
        outbox,
        config.billing.clone(),
    ));

    // Reconciliation sweeps
    let scheduler = SweepScheduler::new(
        billing.clone(),
        config.primary_sweep_interval,
        config.secondary_sweep_interval,
    );
    let sweeps = tokio::spawn(scheduler.run());

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let state = AppState::new(billing, Some(pool), config);
    let app = build_router(state, metrics_handle);

    if let Err(e) = run_http_server(app, http_addr).await {
        tracing::error!(error = ?e, "HTTP server error");
    }

    // The scheduler holds a service handle, and with it the outbox sender.
    // Once it is gone the worker drains what is queued and exits.
    sweeps.abort();
    let _ = sweeps.await;
    if let Err(e) = notification_worker.await {
        tracing::warn!(error = ?e, "Notification worker ended abnormally");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn build_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let request_timeout = state.request_timeout();

    // API v1 billing routes
    let api_v1 = Router::new()
        .route(
            "/billing/subscription/{user_id}",
            get(handlers::get_subscription),
        )
        .route("/billing/checkout", post(handlers::create_checkout))
        .route("/billing/cancel", post(handlers::cancel_subscription))
        .route("/billing/reactivate", post(handlers::reactivate_subscription))
        .route("/billing/bootstrap", post(handlers::bootstrap_free_tier));

    // Webhook route (separate - uses raw body, no JSON parsing)
    let webhook_routes = Router::new().route("/webhooks/stripe", post(handlers::stripe_webhook));

    // Health routes (no timeout - must always respond quickly)
    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    // Metrics route (no timeout)
    let metrics_route = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    // Build middleware stack (order matters - outermost first)
    let middleware = ServiceBuilder::new()
        // Request ID propagation (outermost)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        // Tracing with request details
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // CORS
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // Request timeout (innermost - closest to handler)
        .layer(TimeoutLayer::new(request_timeout));

    // Combine all routes
    Router::new()
        .nest("/api/v1", api_v1)
        .merge(webhook_routes)
        .layer(middleware)
        .merge(health_routes) // Health routes without timeout
        .merge(metrics_route) // Metrics route without timeout
        .with_state(state)
}

async fn run_http_server(app: Router, addr: SocketAddr) -> anyhow::Result<()> {
    tracing::info!("HTTP server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let service: IntoMakeServiceWithConnectInfo<Router, SocketAddr> =
        app.into_make_service_with_connect_info();

    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn setup_metrics() -> anyhow::Result<PrometheusHandle> {
    // Most ops should complete in <100ms; gateway-bound ones take longer
    let billing_latency_buckets = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.2, 0.5, 1.0, 2.5, 10.0];

    let builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("billing_operation_duration_seconds".to_string()),
        billing_latency_buckets,
    )?;

    let handle = builder.install_recorder()?;

    // Register metrics with descriptions
    metrics::describe_counter!(
        "billing_webhooks_processed_total",
        "Total webhooks processed by event and status"
    );
    metrics::describe_counter!(
        "billing_transitions_total",
        "Committed subscription status transitions"
    );
    metrics::describe_counter!(
        "billing_write_conflicts_total",
        "Conditional writes that lost a race and were re-evaluated"
    );
    metrics::describe_counter!(
        "billing_downgrades_total",
        "Subscriptions moved to the free tier by reason"
    );
    metrics::describe_counter!(
        "billing_reactivations_total",
        "Reactivations by path"
    );
    metrics::describe_counter!(
        "billing_checkouts_created_total",
        "Total checkout sessions created"
    );
    metrics::describe_counter!(
        "billing_sweep_items_total",
        "Reconciliation sweep items by sweep and result"
    );
    metrics::describe_counter!(
        "billing_notifications_total",
        "Outbound notifications by delivery result"
    );
    metrics::describe_histogram!(
        "billing_operation_duration_seconds",
        "Billing operation latency in seconds by operation type"
    );

    Ok(handle)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
