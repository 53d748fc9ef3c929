//! Editor gateway core: error taxonomy, parameter validation, timeout table,
//! operation catalog, and the remote wire messages.

pub mod catalog;
pub mod error;
pub mod timeouts;
pub mod types;
pub mod validation;
pub mod wire;

pub use error::{summarize_parameters, ErrorCategory, ErrorRecord, Severity};
pub use timeouts::{
    TimeoutBudget, TimeoutOverrides, TimeoutTable, TimeoutTableError, MAX_CEILING_MS,
};
pub use types::{CorrelationId, OperationRequest, Outcome, Params};
pub use validation::{
    CrossFieldRule, FieldSpec, OperationSchema, Rule, SchemaError, SchemaRegistry, ValidateError,
    ValidationError, ValueKind, Violation,
};
pub use wire::{RemoteCommand, RemoteReply, WireError};
