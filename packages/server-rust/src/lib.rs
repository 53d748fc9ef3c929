//! Editor gateway server: a bounded-latency, always-answered bridge between
//! tool callers and a long-lived editor process.

pub mod network;
pub mod service;

pub use network::{HttpConfig, NetworkModule, RemoteConfig, ShutdownController};
pub use service::{GatewayConfig, OperationGateway};
