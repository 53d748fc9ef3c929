//! Error taxonomy shared by every gateway component.
//!
//! Every failure surfaced to a caller is an [`ErrorRecord`]: a category from a
//! closed set, a severity that never drops below the category floor, a
//! human-readable message, a machine-readable context mapping, and an optional
//! nested cause.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Params;

/// Keys whose values are never echoed back in error context.
const SENSITIVE_KEYS: &[&str] = &["password", "token", "secret", "api_key", "authorization"];

/// Default maximum length (in chars) of a string value kept in error context.
pub const DEFAULT_CONTEXT_MAX_LEN: usize = 1000;

// ---------------------------------------------------------------------------
// Category and severity
// ---------------------------------------------------------------------------

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The transport to the remote process could not be established or kept.
    Connection,
    /// A deadline was exceeded.
    Timeout,
    /// Caller-supplied parameters were rejected before any remote call.
    Validation,
    /// The remote process answered, and the answer says the operation failed.
    RemoteOperation,
    /// Local I/O or resource limits.
    Resource,
    /// The gateway itself is misconfigured.
    Configuration,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::Connection,
        ErrorCategory::Timeout,
        ErrorCategory::Validation,
        ErrorCategory::RemoteOperation,
        ErrorCategory::Resource,
        ErrorCategory::Configuration,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Connection => "connection",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Validation => "validation",
            ErrorCategory::RemoteOperation => "remote_operation",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Configuration => "configuration",
        }
    }

    /// Lowest severity a record of this category may carry. Also the
    /// severity assigned when the raising component does not escalate.
    #[must_use]
    pub fn severity_floor(self) -> Severity {
        match self {
            ErrorCategory::Connection | ErrorCategory::Timeout | ErrorCategory::Configuration => {
                Severity::High
            }
            ErrorCategory::RemoteOperation | ErrorCategory::Resource => Severity::Medium,
            ErrorCategory::Validation => Severity::Low,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// Canonical failure payload returned to callers.
///
/// Built once at the point of failure with the `with_*` methods, then passed
/// upward unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{category} error: {message}")]
pub struct ErrorRecord {
    category: ErrorCategory,
    severity: Severity,
    message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    context: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[source]
    cause: Option<Box<ErrorRecord>>,
}

impl ErrorRecord {
    /// Creates a record with the category's default severity.
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            severity: category.severity_floor(),
            message: message.into(),
            context: BTreeMap::new(),
            cause: None,
        }
    }

    /// A fault nobody anticipated: remote-operation category, critical severity.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RemoteOperation, message).with_severity(Severity::Critical)
    }

    /// Sets the severity, clamped so it never falls below the category floor.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity.max(self.category.severity_floor());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: ErrorRecord) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    #[must_use]
    pub fn cause(&self) -> Option<&ErrorRecord> {
        self.cause.as_deref()
    }

    /// The view of this record handed to callers.
    ///
    /// Critical records are reduced to a terse message plus the keys in
    /// `keep`; the full record is expected to have been logged already.
    #[must_use]
    pub fn caller_view(&self, keep: &[&str]) -> ErrorRecord {
        if self.severity < Severity::Critical {
            return self.clone();
        }
        let context = self
            .context
            .iter()
            .filter(|(key, _)| keep.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        ErrorRecord {
            category: self.category,
            severity: self.severity,
            message: "internal gateway fault; see server logs".to_string(),
            context,
            cause: None,
        }
    }

    /// Emits the record through `tracing` at a level derived from severity.
    pub fn log(&self) {
        let context = Value::Object(self.context.clone().into_iter().collect());
        let cause = self.cause.as_deref().map(ToString::to_string);
        let category = self.category.as_str();
        let severity = self.severity.as_str();
        match self.severity {
            Severity::Low => {
                tracing::info!(category, severity, %context, ?cause, "{}", self.message);
            }
            Severity::Medium => {
                tracing::warn!(category, severity, %context, ?cause, "{}", self.message);
            }
            Severity::High => {
                tracing::error!(category, severity, %context, ?cause, "{}", self.message);
            }
            Severity::Critical => {
                tracing::error!(
                    critical = true,
                    category,
                    severity,
                    %context,
                    ?cause,
                    "{}",
                    self.message
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter summarization
// ---------------------------------------------------------------------------

/// Produces a copy of `params` safe to embed in error context: sensitive keys
/// are redacted and strings longer than `max_len` chars are truncated.
#[must_use]
pub fn summarize_parameters(params: &Params, max_len: usize) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(key, value)| {
                let summarized = if is_sensitive(key) {
                    Value::String("<redacted>".to_string())
                } else {
                    summarize_value(value, max_len)
                };
                (key.clone(), summarized)
            })
            .collect(),
    )
}

fn summarize_value(value: &Value, max_len: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s, max_len)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| summarize_value(v, max_len)).collect())
        }
        Value::Object(map) => summarize_parameters(map, max_len),
        other => other.clone(),
    }
}

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| lower.contains(s))
}

fn truncate(s: &str, max_len: usize) -> String {
    let total = s.chars().count();
    if total <= max_len {
        return s.to_string();
    }
    let head: String = s.chars().take(max_len).collect();
    format!("{head}...[truncated, {total} chars]")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_severity_follows_category() {
        assert_eq!(
            ErrorRecord::new(ErrorCategory::Timeout, "t").severity(),
            Severity::High
        );
        assert_eq!(
            ErrorRecord::new(ErrorCategory::Connection, "c").severity(),
            Severity::High
        );
        assert_eq!(
            ErrorRecord::new(ErrorCategory::Validation, "v").severity(),
            Severity::Low
        );
        assert_eq!(
            ErrorRecord::new(ErrorCategory::RemoteOperation, "r").severity(),
            Severity::Medium
        );
    }

    #[test]
    fn severity_never_drops_below_floor() {
        let record = ErrorRecord::new(ErrorCategory::Timeout, "t").with_severity(Severity::Low);
        assert_eq!(record.severity(), Severity::High);

        let record = ErrorRecord::new(ErrorCategory::Validation, "v")
            .with_severity(Severity::Critical)
            .with_severity(Severity::Medium);
        assert_eq!(record.severity(), Severity::Medium);
    }

    #[test]
    fn every_category_has_a_floor_at_or_below_high() {
        for category in ErrorCategory::ALL {
            let record = ErrorRecord::new(category, "x");
            assert!(record.severity() <= Severity::High, "{category}");
        }
    }

    #[test]
    fn internal_is_critical_remote_operation() {
        let record = ErrorRecord::internal("boom");
        assert_eq!(record.category(), ErrorCategory::RemoteOperation);
        assert_eq!(record.severity(), Severity::Critical);
    }

    #[test]
    fn cause_is_exposed_as_error_source() {
        let cause = ErrorRecord::new(ErrorCategory::Connection, "refused");
        let record =
            ErrorRecord::new(ErrorCategory::Connection, "gave up").with_cause(cause.clone());
        let source = std::error::Error::source(&record).expect("source");
        assert_eq!(source.to_string(), cause.to_string());
        assert_eq!(record.cause(), Some(&cause));
    }

    #[test]
    fn caller_view_hides_critical_details() {
        let record = ErrorRecord::internal("panic at /home/build/src/secret.rs:42")
            .with_context("operation", "manage_scene")
            .with_context("backtrace", "frames...");
        let view = record.caller_view(&["operation"]);
        assert!(!view.message().contains("secret.rs"));
        assert_eq!(view.context().len(), 1);
        assert_eq!(view.context()["operation"], json!("manage_scene"));
        assert_eq!(view.severity(), Severity::Critical);
    }

    #[test]
    fn caller_view_keeps_non_critical_records() {
        let record = ErrorRecord::new(ErrorCategory::Timeout, "slow").with_context("a", 1);
        assert_eq!(record.caller_view(&[]), record);
    }

    #[test]
    fn serialization_round_trips_nested_cause() {
        let record = ErrorRecord::new(ErrorCategory::Connection, "outer")
            .with_context("attempts", 3)
            .with_cause(ErrorRecord::new(ErrorCategory::Connection, "inner"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["cause"]["message"], "inner");
        let back: ErrorRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn summarize_redacts_and_truncates() {
        let mut params = Params::new();
        params.insert("api_key".to_string(), json!("sk-123"));
        params.insert("Password".to_string(), json!("hunter2"));
        params.insert("contents".to_string(), json!("x".repeat(20)));
        params.insert("nested".to_string(), json!({"token": "t", "n": 5}));

        let summary = summarize_parameters(&params, 8);
        assert_eq!(summary["api_key"], "<redacted>");
        assert_eq!(summary["Password"], "<redacted>");
        assert_eq!(summary["contents"], "xxxxxxxx...[truncated, 20 chars]");
        assert_eq!(summary["nested"]["token"], "<redacted>");
        assert_eq!(summary["nested"]["n"], 5);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo", 2), "hé...[truncated, 5 chars]");
    }
}
