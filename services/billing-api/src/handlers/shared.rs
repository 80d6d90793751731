//! Shared handler utilities
//!
//! Identifier parsing and metrics helpers used across handlers.

use std::time::Instant;

use critiq_types::{PlanId, UserId};

use crate::error::ApiError;

// ============================================================================
// Input Validation
// ============================================================================

/// Parse a user id from a path segment or request field
pub fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    UserId::parse(raw.trim()).map_err(|_| ApiError::BadRequest("Invalid user_id".to_string()))
}

/// Parse a plan id from a request field
pub fn parse_plan_id(raw: &str) -> Result<PlanId, ApiError> {
    PlanId::parse(raw.trim()).map_err(|_| ApiError::BadRequest("Invalid plan_id".to_string()))
}

// ============================================================================
// Metrics Helpers
// ============================================================================

/// Record operation duration with result label.
///
/// Labels: operation, result (ok/err)
#[inline]
pub fn record_op_duration(operation: &'static str, start: Instant, success: bool) {
    let result = if success { "ok" } else { "err" };
    metrics::histogram!(
        "billing_operation_duration_seconds",
        "operation" => operation,
        "result" => result
    )
    .record(start.elapsed().as_secs_f64());
}

/// Time a handler body and record its duration under `operation`
pub async fn timed<T, F>(operation: &'static str, body: F) -> Result<T, ApiError>
where
    F: std::future::Future<Output = Result<T, ApiError>>,
{
    let start = Instant::now();
    let result = body.await;
    record_op_duration(operation, start, result.is_ok());
    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_id() {
        let id = UserId::new();
        assert_eq!(parse_user_id(&id.to_string()).unwrap(), id);
        assert_eq!(parse_user_id(&format!(" {id} ")).unwrap(), id);
        assert!(parse_user_id("").is_err());
        assert!(parse_user_id("not-a-uuid").is_err());
        assert!(parse_user_id("../../etc/passwd").is_err());
    }

    #[test]
    fn test_parse_plan_id() {
        let id = PlanId::new();
        assert_eq!(parse_plan_id(&id.to_string()).unwrap(), id);
        assert!(parse_plan_id("premium").is_err());
    }
}
