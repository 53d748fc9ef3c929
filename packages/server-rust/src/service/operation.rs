//! Request, error, and lifecycle types that flow through the operation
//! pipeline.

use std::time::Duration;

use gateway_core::{CorrelationId, Params, TimeoutBudget, ValidateError};
use serde::Serialize;
use serde_json::Value;

use crate::network::connection::{ExchangeError, ExchangeStage};
use crate::service::registry::Admission;

// ---------------------------------------------------------------------------
// InvocationPhase
// ---------------------------------------------------------------------------

/// Lifecycle of one invocation.
///
/// `Received -> Validating -> (Rejected | Admitted) -> Dispatching ->
/// (Completed | TimedOut | Failed)`. No phase is entered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPhase {
    Received,
    Validating,
    Rejected,
    Admitted,
    Dispatching,
    Completed,
    TimedOut,
    Failed,
}

impl InvocationPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationPhase::Received => "received",
            InvocationPhase::Validating => "validating",
            InvocationPhase::Rejected => "rejected",
            InvocationPhase::Admitted => "admitted",
            InvocationPhase::Dispatching => "dispatching",
            InvocationPhase::Completed => "completed",
            InvocationPhase::TimedOut => "timed_out",
            InvocationPhase::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationPhase::Rejected
                | InvocationPhase::Completed
                | InvocationPhase::TimedOut
                | InvocationPhase::Failed
        )
    }

    /// Whether `next` may directly follow `self`.
    ///
    /// Any non-terminal phase may fail: an unanticipated fault can strike
    /// before dispatch begins.
    #[must_use]
    pub fn can_transition(self, next: InvocationPhase) -> bool {
        use InvocationPhase::{
            Admitted, Completed, Dispatching, Failed, Received, Rejected, TimedOut, Validating,
        };
        match (self, next) {
            (Received, Validating)
            | (Validating, Rejected | Admitted)
            | (Admitted, Dispatching)
            | (Admitted | Dispatching, TimedOut)
            | (Dispatching, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// OperationCall
// ---------------------------------------------------------------------------

/// One invocation travelling down the pipeline.
#[derive(Debug)]
pub struct OperationCall {
    pub name: String,
    pub params: Params,
    pub correlation_id: CorrelationId,
    /// Caller-supplied timeout; clamped to the ceiling on admission.
    pub requested_timeout: Option<Duration>,
    /// Filled in by the deadline layer.
    pub admission: Option<Admission>,
    phase: InvocationPhase,
}

impl OperationCall {
    #[must_use]
    pub fn new(name: impl Into<String>, params: Params, correlation_id: CorrelationId) -> Self {
        Self {
            name: name.into(),
            params,
            correlation_id,
            requested_timeout: None,
            admission: None,
            phase: InvocationPhase::Received,
        }
    }

    #[must_use]
    pub fn with_requested_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.requested_timeout = timeout;
        self
    }

    #[must_use]
    pub fn phase(&self) -> InvocationPhase {
        self.phase
    }

    /// Moves to `next`. An illegal transition is logged and ignored.
    pub fn advance(&mut self, next: InvocationPhase) {
        if self.phase.can_transition(next) {
            tracing::trace!(
                operation = %self.name,
                from = self.phase.as_str(),
                to = next.as_str(),
                "invocation phase"
            );
            self.phase = next;
        } else {
            tracing::warn!(
                operation = %self.name,
                from = self.phase.as_str(),
                to = next.as_str(),
                "illegal invocation phase transition ignored"
            );
        }
    }
}

/// Successful pipeline response: the remote result, passed through unchanged.
pub type OperationResponse = Value;

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Typed faults raised inside the pipeline. Only the gateway turns these
/// into caller-facing error records.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Unknown operation or invalid parameters; nothing was dispatched.
    #[error(transparent)]
    Rejected(#[from] ValidateError),
    #[error("operation '{operation}' timed out after {}ms", elapsed.as_millis())]
    Timeout {
        operation: String,
        budget: TimeoutBudget,
        elapsed: Duration,
        /// Where the exchange was when the deadline struck, if known.
        stage: Option<ExchangeStage>,
    },
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Phase an invocation settles in once its pipeline result is known.
#[must_use]
pub fn settled_phase(result: &Result<OperationResponse, OperationError>) -> InvocationPhase {
    match result {
        Ok(_) => InvocationPhase::Completed,
        Err(err) => err.terminal_phase(),
    }
}

impl OperationError {
    /// Terminal phase this fault puts the invocation in.
    #[must_use]
    pub fn terminal_phase(&self) -> InvocationPhase {
        match self {
            OperationError::Rejected(_) => InvocationPhase::Rejected,
            OperationError::Timeout { .. }
            | OperationError::Exchange(
                ExchangeError::Timeout { .. } | ExchangeError::Cancelled { .. },
            ) => InvocationPhase::TimedOut,
            OperationError::Exchange(_) | OperationError::Internal(_) => InvocationPhase::Failed,
        }
    }

    /// Short label used for metrics and span fields.
    #[must_use]
    pub fn outcome_label(&self) -> &'static str {
        match self {
            OperationError::Rejected(ValidateError::UnknownOperation { .. }) => "unknown_operation",
            OperationError::Rejected(ValidateError::Invalid(_)) => "invalid",
            OperationError::Timeout { .. }
            | OperationError::Exchange(
                ExchangeError::Timeout { .. } | ExchangeError::Cancelled { .. },
            ) => "timeout",
            OperationError::Exchange(ExchangeError::Remote { .. }) => "remote_error",
            OperationError::Exchange(_) => "connection_error",
            OperationError::Internal(_) => "internal_error",
        }
    }
}
