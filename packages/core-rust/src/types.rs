use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorRecord;

/// Parameter mapping carried by every operation request.
///
/// Uses `serde_json::Map` so parameters round-trip unchanged between the
/// caller-facing JSON surface and the downstream JSON wire format.
pub type Params = serde_json::Map<String, Value>;

/// Opaque token identifying one operation request end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a fresh random correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A named operation plus its parameters, as received from the caller.
///
/// Immutable once created; consumed once by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    name: String,
    parameters: Params,
    correlation_id: CorrelationId,
    requested_timeout: Option<Duration>,
}

impl OperationRequest {
    /// Creates a request with a freshly generated correlation id.
    #[must_use]
    pub fn new(name: impl Into<String>, parameters: Params) -> Self {
        Self {
            name: name.into(),
            parameters,
            correlation_id: CorrelationId::new(),
            requested_timeout: None,
        }
    }

    /// Asks for a specific timeout instead of the operation's class default.
    /// The global ceiling still applies.
    #[must_use]
    pub fn with_requested_timeout(mut self, timeout: Duration) -> Self {
        self.requested_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parameters(&self) -> &Params {
        &self.parameters
    }

    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    #[must_use]
    pub fn requested_timeout(&self) -> Option<Duration> {
        self.requested_timeout
    }

    /// Splits the request into its parts for hand-off into the pipeline.
    #[must_use]
    pub fn into_parts(self) -> (String, Params, CorrelationId) {
        (self.name, self.parameters, self.correlation_id)
    }
}

/// Terminal outcome of one invocation.
///
/// Serializes as `{"success": <value>}` or `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success(Value),
    Error(ErrorRecord),
}

impl Outcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Returns the error record if this outcome is a failure.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Error(record) => Some(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn request_keeps_parameters_and_id() {
        let mut params = Params::new();
        params.insert("action".to_string(), json!("load"));
        let request = OperationRequest::new("manage_scene", params.clone());
        let id = request.correlation_id();

        let (name, parameters, correlation_id) = request.into_parts();
        assert_eq!(name, "manage_scene");
        assert_eq!(parameters, params);
        assert_eq!(correlation_id, id);
    }

    #[test]
    fn outcome_serializes_as_tagged_union() {
        let ok = Outcome::Success(json!({"loaded": true}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"success": {"loaded": true}})
        );

        let err = Outcome::Error(ErrorRecord::new(ErrorCategory::Timeout, "too slow"));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["category"], "timeout");
        assert_eq!(value["error"]["severity"], "high");
        assert_eq!(value["error"]["message"], "too slow");
    }
}
