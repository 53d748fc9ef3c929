//! Metrics middleware for operations.
//!
//! Wraps each invocation in an `operation` span carrying the operation name
//! and correlation id, records duration, outcome and the settled phase on
//! it, and feeds the
//! `gateway_operations_total` / `gateway_operation_duration_seconds` series.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{settled_phase, OperationCall, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments operations with timing and outcome.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<OperationCall> for MetricsService<S>
where
    S: Service<OperationCall, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: OperationCall) -> Self::Future {
        let operation = call.name.clone();

        let span = info_span!(
            "operation",
            operation = %operation,
            correlation_id = %call.correlation_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
            phase = tracing::field::Empty,
        );

        // Entered so that validation and admission inside `call` land in the span.
        let fut = span.in_scope(|| self.inner.call(call));

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "success",
                    Err(err) => err.outcome_label(),
                };
                let phase = settled_phase(&result).as_str();

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);
                span.record("phase", phase);

                metrics::counter!(
                    "gateway_operations_total",
                    "operation" => operation.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(
                    "gateway_operation_duration_seconds",
                    "operation" => operation.clone()
                )
                .record(elapsed.as_secs_f64());

                tracing::info!(
                    operation = %operation,
                    duration_ms,
                    outcome,
                    phase,
                    "operation complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use gateway_core::{CorrelationId, Params};
    use parking_lot::Mutex;
    use serde_json::json;
    use tower::ServiceExt;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};

    use super::*;
    use crate::network::connection::{ExchangeError, ExchangeStage};

    /// Collects every `phase` value recorded on a span.
    #[derive(Clone, Default)]
    struct PhaseCapture(Arc<Mutex<Vec<String>>>);

    struct PhaseVisitor(Option<String>);

    impl Visit for PhaseVisitor {
        fn record_str(&mut self, field: &Field, value: &str) {
            if field.name() == "phase" {
                self.0 = Some(value.to_string());
            }
        }

        fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for PhaseCapture {
        fn on_record(
            &self,
            _id: &tracing::span::Id,
            values: &tracing::span::Record<'_>,
            _ctx: LayerContext<'_, S>,
        ) {
            let mut visitor = PhaseVisitor(None);
            values.record(&mut visitor);
            if let Some(phase) = visitor.0 {
                self.0.lock().push(phase);
            }
        }
    }

    /// Immediately-completing service; fails when the operation is named
    /// "fail" and times out when it is named "silent".
    #[derive(Clone)]
    struct ImmediateService;

    impl Service<OperationCall> for ImmediateService {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, call: OperationCall) -> Self::Future {
            Box::pin(async move {
                if call.name == "fail" {
                    Err(OperationError::Exchange(ExchangeError::Remote {
                        message: "nope".to_string(),
                    }))
                } else if call.name == "silent" {
                    Err(OperationError::Exchange(ExchangeError::Timeout {
                        stage: ExchangeStage::AwaitingReply,
                        waited: Duration::from_secs(1),
                    }))
                } else {
                    Ok(json!({ "op": call.name }))
                }
            })
        }
    }

    #[tokio::test]
    async fn passes_through_response() {
        let svc = MetricsLayer.layer(ImmediateService);
        let call = OperationCall::new("manage_editor", Params::new(), CorrelationId::new());
        let resp = svc.oneshot(call).await.unwrap();
        assert_eq!(resp, json!({"op": "manage_editor"}));
    }

    #[tokio::test]
    async fn passes_through_error() {
        let svc = MetricsLayer.layer(ImmediateService);
        let call = OperationCall::new("fail", Params::new(), CorrelationId::new());
        let err = svc.oneshot(call).await.unwrap_err();
        assert_eq!(err.outcome_label(), "remote_error");
    }

    #[tokio::test]
    async fn span_records_the_settled_phase() {
        let capture = PhaseCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        for name in ["manage_editor", "silent", "fail"] {
            let call = OperationCall::new(name, Params::new(), CorrelationId::new());
            let _ = MetricsLayer.layer(ImmediateService).oneshot(call).await;
        }

        assert_eq!(
            *capture.0.lock(),
            vec!["completed".to_string(), "timed_out".to_string(), "failed".to_string()]
        );
    }
}
