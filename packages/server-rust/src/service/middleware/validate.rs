//! Validation middleware: checks parameters against the operation's schema
//! before any deadline is admitted or the remote session is touched.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use gateway_core::SchemaRegistry;
use tower::{Layer, Service};

use crate::service::operation::{
    InvocationPhase, OperationCall, OperationError, OperationResponse,
};

// ---------------------------------------------------------------------------
// ValidationLayer
// ---------------------------------------------------------------------------

/// Tower layer that rejects unknown operations and invalid parameters.
#[derive(Debug, Clone)]
pub struct ValidationLayer {
    schemas: Arc<SchemaRegistry>,
}

impl ValidationLayer {
    #[must_use]
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self { schemas }
    }
}

impl<S> Layer<S> for ValidationLayer {
    type Service = ValidationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ValidationService {
            inner,
            schemas: Arc::clone(&self.schemas),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidationService<S> {
    inner: S,
    schemas: Arc<SchemaRegistry>,
}

impl<S> Service<OperationCall> for ValidationService<S>
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
        call.advance(InvocationPhase::Validating);
        let params = std::mem::take(&mut call.params);
        match self.schemas.validate(&call.name, params) {
            Ok(params) => {
                call.params = params;
                Box::pin(self.inner.call(call))
            }
            Err(err) => {
                call.advance(InvocationPhase::Rejected);
                Box::pin(async move { Err(OperationError::Rejected(err)) })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
