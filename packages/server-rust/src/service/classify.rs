//! Fault classification: turns typed pipeline faults into the error records
//! callers receive.
//!
//! Lower layers only raise typed errors; this module is the one place that
//! decides category, severity and context.

use std::time::Duration;

use gateway_core::{
    CorrelationId, ErrorCategory, ErrorRecord, SchemaRegistry, Severity, TimeoutBudget,
};
use serde_json::{json, Value};

use crate::network::connection::{ExchangeError, ExchangeStage};
use crate::service::operation::OperationError;

/// Context keys kept when a critical record is reduced for the caller.
pub const CALLER_VISIBLE_KEYS: &[&str] = &["operation", "correlation_id", "elapsed_ms"];

/// Request-side facts attached to every classified record.
#[derive(Debug, Clone)]
pub struct FaultContext<'a> {
    pub operation: &'a str,
    pub correlation_id: CorrelationId,
    /// Redacted and truncated copy of the request parameters.
    pub parameters: Value,
    pub budget: &'a TimeoutBudget,
    pub elapsed: Duration,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl FaultContext<'_> {
    fn attach(&self, record: ErrorRecord) -> ErrorRecord {
        record
            .with_context("operation", self.operation)
            .with_context("correlation_id", self.correlation_id.to_string())
            .with_context("parameters", self.parameters.clone())
            .with_context("elapsed_ms", millis(self.elapsed))
    }

    fn attach_budget(&self, record: ErrorRecord) -> ErrorRecord {
        let record = record
            .with_context("timeout_ms", millis(self.budget.duration))
            .with_context("timeout_clamped", self.budget.clamped);
        match &self.budget.class {
            Some(class) => record.with_context("timeout_class", class.as_str()),
            None => record,
        }
    }
}

/// Classifies a pipeline fault.
#[must_use]
pub fn classify(err: &OperationError, ctx: &FaultContext<'_>, schemas: &SchemaRegistry) -> ErrorRecord {
    let record = match err {
        OperationError::Rejected(rejected) => return ctx.attach(schemas.to_record(rejected)),
        OperationError::Timeout {
            budget,
            elapsed,
            stage,
            ..
        } => timeout_record(ctx.operation, budget.duration, *elapsed, *stage),
        OperationError::Exchange(exchange) => classify_exchange(ctx.operation, exchange, ctx.budget),
        OperationError::Internal(source) => {
            ErrorRecord::internal(format!("unexpected fault in '{}': {source:#}", ctx.operation))
        }
    };
    ctx.attach_budget(ctx.attach(record))
}

/// Record for a fault that escaped the pipeline entirely, such as a panic.
#[must_use]
pub fn classify_unexpected(message: &str, ctx: &FaultContext<'_>) -> ErrorRecord {
    ctx.attach_budget(ctx.attach(ErrorRecord::internal(format!(
        "unexpected fault in '{}': {message}",
        ctx.operation
    ))))
}

/// Record for an invocation refused because the gateway is shutting down.
#[must_use]
pub fn classify_refused(ctx: &FaultContext<'_>) -> ErrorRecord {
    ctx.attach(ErrorRecord::new(
        ErrorCategory::Connection,
        "gateway is shutting down",
    ))
}

/// Record for an invocation that outlived its outer wall-clock bound.
#[must_use]
pub fn classify_overrun(ctx: &FaultContext<'_>) -> ErrorRecord {
    let record = timeout_record(ctx.operation, ctx.budget.duration, ctx.elapsed, None)
        .with_context("outer_bound", true);
    ctx.attach_budget(ctx.attach(record))
}

fn timeout_record(
    operation: &str,
    limit: Duration,
    elapsed: Duration,
    stage: Option<ExchangeStage>,
) -> ErrorRecord {
    let record = ErrorRecord::new(
        ErrorCategory::Timeout,
        format!(
            "operation '{operation}' timed out after {}ms (limit {}ms)",
            millis(elapsed),
            millis(limit)
        ),
    );
    match stage {
        Some(stage) => record.with_context("stage", stage.as_str()),
        None => record,
    }
}

fn classify_exchange(operation: &str, err: &ExchangeError, budget: &TimeoutBudget) -> ErrorRecord {
    match err {
        ExchangeError::Connect { endpoint, attempts } => {
            ErrorRecord::new(ErrorCategory::Connection, err.to_string())
                .with_context("endpoint", endpoint.as_str())
                .with_context("attempts", json!(attempts))
        }
        ExchangeError::Timeout { stage, waited } => {
            timeout_record(operation, budget.duration, *waited, Some(*stage))
        }
        ExchangeError::Cancelled { stage } => {
            ErrorRecord::new(ErrorCategory::Timeout, err.to_string())
                .with_context("stage", stage.as_str())
        }
        ExchangeError::Dropped { reason } | ExchangeError::Protocol { reason } => {
            ErrorRecord::new(ErrorCategory::Connection, err.to_string())
                .with_context("reason", reason.as_str())
        }
        ExchangeError::Closed => ErrorRecord::new(ErrorCategory::Connection, err.to_string()),
        ExchangeError::Remote { message } => {
            ErrorRecord::new(ErrorCategory::RemoteOperation, err.to_string())
                .with_severity(Severity::Medium)
                .with_context("remote_message", message.as_str())
        }
        ExchangeError::Encode(source) => {
            ErrorRecord::new(ErrorCategory::Resource, format!("cannot encode request: {source}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
