//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use audit_events_core::health::{BrokerHealth, HealthCheck};
use axum::{Json, extract::State, http::StatusCode};
use std::sync::Arc;

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK to indicate the service is running.
/// This endpoint does NOT check the broker.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Broker health as last observed by the dispatch pipeline.
///
/// # Status Codes
///
/// - 200 OK: up, or nothing sent yet
/// - 503 Service Unavailable: the last send failed
///
/// # Endpoint
///
/// ```text
/// GET /health/broker
/// ```
///
/// # Response
///
/// ```json
/// {
///   "component": "kafka",
///   "status": "down",
///   "message": "Last send failed: broker unreachable",
///   "metadata": [["failures", "3"]]
/// }
/// ```
#[allow(clippy::unused_async)]
pub async fn broker_health(
    State(health): State<Arc<BrokerHealth>>,
) -> (StatusCode, Json<HealthCheck>) {
    let check = health.check();
    let status = if check.status.is_down() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(check))
}
