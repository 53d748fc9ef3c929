//! HTTP handler definitions for the caller-facing surface.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and the route table.

pub mod health;
pub mod operations;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use operations::{invoke_handler, list_operations_handler};

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;

use super::ShutdownController;
use crate::service::OperationGateway;

/// Shared application state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<OperationGateway>,
    pub shutdown: Arc<ShutdownController>,
    /// Process start time, used for uptime calculation.
    pub start_time: Instant,
}

/// Routes, without transport middleware:
/// - `GET /health` -- detailed health JSON
/// - `GET /health/live` -- liveness probe
/// - `GET /health/ready` -- readiness probe
/// - `GET /operations` -- operation listing with effective budgets
/// - `POST /operations/{name}` -- invoke one operation
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/operations", get(list_operations_handler))
        .route("/operations/{name}", post(invoke_handler))
}

#[cfg(test)]
pub(crate) fn test_state(handler: crate::network::test_helpers::Handler) -> AppState {
    AppState {
        gateway: crate::network::test_helpers::gateway(handler),
        shutdown: Arc::new(ShutdownController::new()),
        start_time: Instant::now(),
    }
}
