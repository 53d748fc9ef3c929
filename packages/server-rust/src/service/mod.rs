//! Operation gateway and its tower pipeline.
//!
//! 1. **Gateway** (`gateway`): entry point; one terminal `Outcome` per request
//! 2. **Middleware** (`middleware`): metrics, validation and deadline layers
//! 3. **Dispatch** (`dispatch`): hands admitted calls to the connection manager
//! 4. **Registry** (`registry`): in-flight operations and their deadlines
//! 5. **Classification** (`classify`): typed faults to error records
//! 6. **Health** (`health`): read-only view for health checks
//! 7. **Background workers** (`worker`): deadline sweep and liveness probe

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod health;
pub mod middleware;
pub mod operation;
pub mod registry;
pub mod worker;

pub use config::{load_timeout_table, GatewayConfig};
pub use dispatch::RemoteDispatcher;
pub use gateway::{OperationGateway, OperationInfo};
pub use health::{HealthReport, HealthReporter, HealthStatus};
pub use operation::{
    settled_phase, InvocationPhase, OperationCall, OperationError, OperationResponse,
};
pub use registry::{Admission, InFlightSnapshot, OperationToken, TimeoutRegistry};
pub use worker::{BackgroundRunnable, BackgroundWorker, ProbeRunnable, SweepRunnable};
