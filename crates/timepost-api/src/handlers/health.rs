//! Liveness, metrics and health endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// `GET /ping`, used by the server's own health probe.
pub async fn ping() -> &'static str {
    "pong"
}

/// `GET /metric`: snapshot of the delivery counters.
#[instrument(name = "metric", skip_all)]
pub async fn metric(State(state): State<AppState>) -> Response {
    let snapshot = state.stats.read().await.clone();
    (StatusCode::OK, Json(snapshot)).into_response()
}

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status
    pub status: HealthStatus,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Dedup store reachability
    pub store: ComponentHealth,
    /// Service version
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything works
    Healthy,
    /// Something critical is failing
    Unhealthy,
}

/// Health of one component.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Whether the component answered
    pub up: bool,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// How long the check took
    pub response_time_ms: u64,
}

/// `GET /health`: checks the dedup store.
#[instrument(name = "health_check", skip_all)]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let started = state.clock.now();
    let result = state.store.health_check().await;
    let response_time_ms =
        u64::try_from(state.clock.now().saturating_duration_since(started).as_millis())
            .unwrap_or(u64::MAX);

    let store = match result {
        Ok(()) => ComponentHealth { up: true, message: None, response_time_ms },
        Err(e) => {
            error!(error = %e, "dedup store health check failed");
            ComponentHealth { up: false, message: Some(e.to_string()), response_time_ms }
        },
    };
    let status = if store.up { HealthStatus::Healthy } else { HealthStatus::Unhealthy };
    debug!(?status, "health check completed");

    let body = HealthResponse {
        status,
        timestamp: state.clock.now_utc(),
        store,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(body)).into_response()
}
