//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use gateway_core::SchemaRegistry;
use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use super::timeout::DeadlineLayer;
use super::validate::ValidationLayer;
use crate::service::dispatch::RemoteDispatcher;
use crate::service::operation::{OperationCall, OperationError, OperationResponse};
use crate::service::registry::TimeoutRegistry;

/// The assembled pipeline. Clone it and `oneshot` one call per clone.
pub type OperationPipeline = BoxCloneSyncService<OperationCall, OperationResponse, OperationError>;

/// Build the operation pipeline by wrapping the `RemoteDispatcher` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- span, timing and outcome for every invocation
/// 2. `ValidationLayer` -- reject before any deadline is admitted
/// 3. `DeadlineLayer` -- admit into the timeout registry and bound the exchange
#[must_use]
pub fn build_operation_pipeline(
    schemas: Arc<SchemaRegistry>,
    registry: Arc<TimeoutRegistry>,
    dispatcher: RemoteDispatcher,
) -> OperationPipeline {
    let service = ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(ValidationLayer::new(schemas))
        .layer(DeadlineLayer::new(registry))
        .service(dispatcher);
    BoxCloneSyncService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
