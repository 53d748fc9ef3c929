//! Operation listing and invocation handlers.
//!
//! Every invocation answers with an `Outcome` body. Malformed bodies and
//! query strings become Validation outcomes rather than HTTP errors.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use gateway_core::{CorrelationId, ErrorCategory, ErrorRecord, OperationRequest, Outcome, Params};
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::service::OperationInfo;

/// Query string accepted by `POST /operations/{name}`.
#[derive(Debug, Default, Deserialize)]
pub struct InvokeQuery {
    /// Caller-requested budget; still clamped to the ceiling. 0 means unset.
    pub timeout_ms: Option<u64>,
}

pub async fn list_operations_handler(State(state): State<AppState>) -> Json<Vec<OperationInfo>> {
    Json(state.gateway.operations())
}

/// Invokes the named operation with the JSON object body as parameters.
///
/// An empty body is treated as `{}`.
pub async fn invoke_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<InvokeQuery>, QueryRejection>,
    body: Bytes,
) -> Json<Outcome> {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            return Json(malformed(&name, format!("invalid query string: {}", rejection.body_text())));
        }
    };
    let params = match parse_params(&body) {
        Ok(params) => params,
        Err(reason) => return Json(malformed(&name, reason)),
    };

    let mut request = OperationRequest::new(name, params);
    if let Some(ms) = query.timeout_ms {
        request = request.with_requested_timeout(Duration::from_millis(ms));
    }
    Json(state.gateway.invoke_request(request).await)
}

fn parse_params(body: &[u8]) -> Result<Params, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Params::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(params)) => Ok(params),
        Ok(other) => Err(format!(
            "request body must be a JSON object, got {}",
            json_kind(&other)
        )),
        Err(e) => Err(format!("request body is not valid JSON: {e}")),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn malformed(operation: &str, reason: String) -> Outcome {
    let record = ErrorRecord::new(ErrorCategory::Validation, reason)
        .with_context("operation", operation)
        .with_context("correlation_id", CorrelationId::new().to_string());
    record.log();
    Outcome::Error(record)
}
