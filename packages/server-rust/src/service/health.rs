//! Read-only health view over the remote session and the in-flight table.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::network::connection::{ConnectAttempt, ConnectionManager};
use crate::network::metrics::MetricsSnapshot;
use crate::network::session::SessionState;
use crate::service::registry::{InFlightSnapshot, TimeoutRegistry};

/// Overall gateway health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Snapshot returned by the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub session_state: SessionState,
    pub consecutive_failures: u32,
    pub endpoint: String,
    pub metrics: MetricsSnapshot,
    pub in_flight: usize,
    pub active_operations: Vec<InFlightSnapshot>,
    pub timeouts_swept: u64,
    /// Most recent connect sequence, for diagnosing an unreachable editor.
    pub last_connect_attempts: Vec<ConnectAttempt>,
}

/// Healthy only when connected with no outstanding failures and acceptable
/// latency; unhealthy whenever no usable transport exists.
#[must_use]
pub fn assess(
    state: SessionState,
    consecutive_failures: u32,
    average_latency: Option<Duration>,
    degraded_latency: Duration,
) -> HealthStatus {
    match state {
        SessionState::Disconnected | SessionState::Connecting => HealthStatus::Unhealthy,
        SessionState::Degraded => HealthStatus::Degraded,
        SessionState::Connected => {
            let slow = average_latency.is_some_and(|avg| avg > degraded_latency);
            if consecutive_failures > 0 || slow {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
    }
}

pub struct HealthReporter {
    connection: Arc<ConnectionManager>,
    registry: Arc<TimeoutRegistry>,
    degraded_latency: Duration,
}

impl HealthReporter {
    #[must_use]
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<TimeoutRegistry>,
        degraded_latency: Duration,
    ) -> Self {
        Self {
            connection,
            registry,
            degraded_latency,
        }
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        assess(
            self.connection.state(),
            self.connection.consecutive_failures(),
            self.connection.metrics().average_latency(),
            self.degraded_latency,
        )
    }

    #[must_use]
    pub fn report(&self) -> HealthReport {
        let session_state = self.connection.state();
        let consecutive_failures = self.connection.consecutive_failures();
        let status = assess(
            session_state,
            consecutive_failures,
            self.connection.metrics().average_latency(),
            self.degraded_latency,
        );
        let active_operations = self.registry.in_flight();
        HealthReport {
            status,
            session_state,
            consecutive_failures,
            endpoint: self.connection.endpoint(),
            metrics: self.connection.metrics().snapshot(),
            in_flight: active_operations.len(),
            active_operations,
            timeouts_swept: self.registry.swept_total(),
            last_connect_attempts: self.connection.last_connect_attempts(),
        }
    }
}
