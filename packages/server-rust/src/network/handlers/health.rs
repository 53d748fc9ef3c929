//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::network::HealthState;
use crate::service::HealthReport;

/// Body of `GET /health`: process lifecycle plus the gateway's own report.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub state: HealthState,
    pub accepting: bool,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// Returns detailed health information as JSON.
///
/// Always returns 200; `status` in the body carries the remote session's
/// health and `state` the process lifecycle.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        state: state.shutdown.health_state(),
        accepting: state.gateway.is_accepting(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        report: state.gateway.health(),
    })
}

/// Liveness probe, always 200 while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 while serving and accepting invocations, 503
/// otherwise.
///
/// The remote session connects lazily on the first invocation, so an idle
/// disconnected session does not make the gateway unready.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready && state.gateway.is_accepting() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
