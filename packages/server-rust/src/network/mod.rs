//! Remote editor session, endpoint configuration, and the caller-facing
//! HTTP surface.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod module;
pub mod session;
pub mod shutdown;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{ConfigError, HttpConfig, RemoteConfig, RetryPolicy, REQUEST_TIMEOUT_MARGIN};
pub use connection::{ConnectAttempt, ConnectionManager, ExchangeError, ExchangeStage, ProbeOutcome};
pub use handlers::AppState;
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use module::NetworkModule;
pub use session::SessionState;
pub use shutdown::{HealthState, ShutdownController};
pub use transport::{Connector, TcpConnector};
