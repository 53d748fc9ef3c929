//! Tower middleware layers for the operation pipeline.
//!
//! - [`metrics`]: Operation span, timing and outcome counters
//! - [`validate`]: Parameter validation against the operation schema
//! - [`timeout`]: Deadline admission and enforcement
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod metrics;
pub mod pipeline;
pub mod timeout;
pub mod validate;

pub use metrics::MetricsLayer;
pub use pipeline::{build_operation_pipeline, OperationPipeline};
pub use timeout::DeadlineLayer;
pub use validate::ValidationLayer;
