//! Innermost pipeline service: hands an admitted call to the connection
//! manager.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;

use crate::network::connection::ConnectionManager;
use crate::service::operation::{
    InvocationPhase, OperationCall, OperationError, OperationResponse,
};

/// Sends each call to the remote process under its admitted deadline and
/// cancellation token.
#[derive(Clone)]
pub struct RemoteDispatcher {
    connection: Arc<ConnectionManager>,
}

impl RemoteDispatcher {
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }
}

impl Service<OperationCall> for RemoteDispatcher {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut call: OperationCall) -> Self::Future {
        let connection = Arc::clone(&self.connection);
        Box::pin(async move {
            let Some(admission) = call.admission.take() else {
                return Err(OperationError::Internal(anyhow::anyhow!(
                    "operation '{}' reached dispatch without an admitted deadline",
                    call.name
                )));
            };
            call.advance(InvocationPhase::Dispatching);
            let result = connection
                .send(&call.name, call.params, admission.deadline, &admission.cancel)
                .await?;
            Ok(result)
        })
    }
}
