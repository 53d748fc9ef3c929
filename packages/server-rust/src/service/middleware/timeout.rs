//! Deadline middleware: admits each operation into the timeout registry,
//! bounds the rest of the pipeline by the admitted deadline, and completes
//! the record however the call ends.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::time::Instant;
use tower::{Layer, Service};

use crate::network::connection::ExchangeError;
use crate::service::operation::{
    InvocationPhase, OperationCall, OperationError, OperationResponse,
};
use crate::service::registry::{OperationToken, TimeoutRegistry};

/// Completes the registry record when dropped, so an aborted or panicking
/// call never leaves it orphaned.
struct CompletionGuard {
    registry: Arc<TimeoutRegistry>,
    token: OperationToken,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.registry.complete(self.token);
    }
}

// ---------------------------------------------------------------------------
// DeadlineLayer
// ---------------------------------------------------------------------------

/// Tower layer that enforces the per-operation deadline from the timeout
/// registry.
///
/// The deadline comes from the operation's timeout class (or the caller's
/// requested timeout), clamped to the global ceiling.
#[derive(Clone)]
pub struct DeadlineLayer {
    registry: Arc<TimeoutRegistry>,
}

impl DeadlineLayer {
    #[must_use]
    pub fn new(registry: Arc<TimeoutRegistry>) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            registry: Arc::clone(&self.registry),
        }
    }
}

// ---------------------------------------------------------------------------
// DeadlineService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DeadlineService<S> {
    inner: S,
    registry: Arc<TimeoutRegistry>,
}

impl<S> Service<OperationCall> for DeadlineService<S>
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

    fn call(&mut self, mut call: OperationCall) -> Self::Future {
        let started = Instant::now();
        let admission =
            self.registry
                .admit(call.correlation_id, &call.name, call.requested_timeout);
        call.advance(InvocationPhase::Admitted);

        let guard = CompletionGuard {
            registry: Arc::clone(&self.registry),
            token: admission.token,
        };
        let deadline = admission.deadline;
        let cancel = admission.cancel.clone();
        let budget = admission.budget.clone();
        let operation = call.name.clone();
        call.admission = Some(admission);
        let fut = self.inner.call(call);

        Box::pin(async move {
            let _guard = guard;
            let timed_out = |stage| OperationError::Timeout {
                operation: operation.clone(),
                budget: budget.clone(),
                elapsed: started.elapsed(),
                stage,
            };
            let result = tokio::select! {
                biased;
                result = fut => result,
                () = cancel.cancelled() => Err(timed_out(None)),
                () = tokio::time::sleep_until(deadline) => Err(timed_out(None)),
            };
            match result {
                Err(OperationError::Exchange(
                    ExchangeError::Timeout { stage, .. } | ExchangeError::Cancelled { stage },
                )) => Err(timed_out(Some(stage))),
                other => other,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
