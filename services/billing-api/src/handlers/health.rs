//! Health check handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub database: &'static str,
}

/// Liveness probe - always returns OK if the service is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - checks database connectivity and that the free plan
/// is seeded, since downgrades cannot complete without it
pub async fn ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, StatusCode> {
    let database = match &state.pool {
        Some(pool) => {
            if let Err(e) = sqlx::query("SELECT 1").execute(pool).await {
                tracing::error!(error = ?e, "Database health check failed");
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
            "connected"
        }
        None => "in_memory",
    };

    if let Err(e) = state.billing.catalog().free_plan().await {
        tracing::error!(error = %e, "Free plan unavailable");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(ReadyResponse {
        status: "ready",
        database,
    }))
}
