//! Declarative per-operation parameter validation.
//!
//! Each operation name maps to an [`OperationSchema`]: a list of field specs
//! (each an ordered list of [`Rule`]s) plus cross-field rules. Validation is
//! pure and collects every violated field before failing, so a single
//! [`ValidationError`] reports all of them.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ErrorCategory, ErrorRecord};
use crate::types::Params;

/// Characters never allowed in a path parameter.
const INVALID_PATH_CHARS: &[char] = &['\0', '<', '>', '"', '|', '?', '*'];

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// JSON value kinds a field can be constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Integer,
    Number,
    Bool,
    Array,
    Object,
}

impl ValueKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Number => "number",
            ValueKind::Bool => "boolean",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }

    /// Returns `true` if `value` is of this kind. Integers also satisfy `Number`.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Number => value.is_number(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
        }
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A single constraint on a field value.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Field must be present, non-null, and (for strings) not blank.
    Required,
    Kind(ValueKind),
    /// Inclusive numeric bounds.
    Range { min: f64, max: f64 },
    /// Inclusive bounds on string length (chars) or array length.
    Length { min: usize, max: usize },
    /// Regular expression the whole string must match.
    Pattern(Regex),
    /// Value must equal one of the listed values.
    OneOf(Vec<Value>),
    /// Value must be an array whose every element is one of the listed values.
    EachOneOf(Vec<Value>),
    /// String usable as a project-relative path.
    Path,
    /// Array of exactly `len` numbers.
    Vector { len: usize },
}

impl Rule {
    /// Checks a present, non-null value. `Required` always passes here.
    fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Rule::Required => Ok(()),
            Rule::Kind(kind) => {
                if kind.matches(value) {
                    Ok(())
                } else {
                    Err(format!(
                        "must be of type {}, got {}",
                        kind.as_str(),
                        kind_name(value)
                    ))
                }
            }
            Rule::Range { min, max } => match value.as_f64() {
                Some(n) if n >= *min && n <= *max => Ok(()),
                Some(n) => Err(format!("must be between {min} and {max}, got {n}")),
                None => Err("must be a number".to_string()),
            },
            Rule::Length { min, max } => {
                let len = match value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    _ => return Err("must be a string or array".to_string()),
                };
                if len >= *min && len <= *max {
                    Ok(())
                } else {
                    Err(format!("length must be between {min} and {max}, got {len}"))
                }
            }
            Rule::Pattern(regex) => match value.as_str() {
                Some(s) if regex.is_match(s) => Ok(()),
                Some(_) => Err(format!("must match pattern {}", regex.as_str())),
                None => Err("must be a string".to_string()),
            },
            Rule::OneOf(choices) => {
                if choices.contains(value) {
                    Ok(())
                } else {
                    Err(format!("must be one of: {}", join_values(choices)))
                }
            }
            Rule::EachOneOf(choices) => match value.as_array() {
                Some(items) => match items.iter().find(|item| !choices.contains(item)) {
                    None => Ok(()),
                    Some(bad) => Err(format!(
                        "contains {bad}; every element must be one of: {}",
                        join_values(choices)
                    )),
                },
                None => Err("must be an array".to_string()),
            },
            Rule::Path => match value.as_str() {
                Some(s) if s.contains(INVALID_PATH_CHARS) => {
                    Err("must be a valid path (contains invalid characters)".to_string())
                }
                Some(s) if s.split(['/', '\\']).any(|segment| segment == "..") => {
                    Err("must be a valid path (parent directory segments are not allowed)"
                        .to_string())
                }
                Some(_) => Ok(()),
                None => Err("must be a string".to_string()),
            },
            Rule::Vector { len } => match value.as_array() {
                Some(items) if items.len() == *len && items.iter().all(Value::is_number) => {
                    Ok(())
                }
                _ => Err(format!("must be a list of {len} numbers")),
            },
        }
    }
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Field and operation schemas
// ---------------------------------------------------------------------------

/// Error raised while building a schema (e.g. an invalid regex).
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid pattern for field '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
}

/// Ordered rules for one named parameter.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    rules: Vec<Rule>,
}

impl FieldSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn required(self) -> Self {
        self.rule(Rule::Required)
    }

    #[must_use]
    pub fn kind(self, kind: ValueKind) -> Self {
        self.rule(Rule::Kind(kind))
    }

    #[must_use]
    pub fn range(self, min: f64, max: f64) -> Self {
        self.rule(Rule::Range { min, max })
    }

    #[must_use]
    pub fn length(self, min: usize, max: usize) -> Self {
        self.rule(Rule::Length { min, max })
    }

    #[must_use]
    pub fn one_of<I, V>(self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.rule(Rule::OneOf(choices.into_iter().map(Into::into).collect()))
    }

    #[must_use]
    pub fn each_one_of<I, V>(self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.rule(Rule::EachOneOf(choices.into_iter().map(Into::into).collect()))
    }

    #[must_use]
    pub fn path(self) -> Self {
        self.rule(Rule::Path)
    }

    #[must_use]
    pub fn vector(self, len: usize) -> Self {
        self.rule(Rule::Vector { len })
    }

    /// Adds a full-match pattern rule.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError::InvalidPattern` if `pattern` is not a valid regex.
    pub fn pattern(self, pattern: &str) -> Result<Self, SchemaError> {
        let regex = Regex::new(pattern).map_err(|source| SchemaError::InvalidPattern {
            field: self.name.clone(),
            source,
        })?;
        Ok(self.rule(Rule::Pattern(regex)))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_required(&self) -> bool {
        self.rules.iter().any(|r| matches!(r, Rule::Required))
    }

    /// Checks the field; only the first failing rule is reported.
    fn check(&self, params: &Params) -> Option<Violation> {
        let value = params.get(&self.name);
        if is_missing(value) {
            return self
                .is_required()
                .then(|| Violation::new(&self.name, "is required"));
        }
        let value = value?;
        self.rules
            .iter()
            .find_map(|rule| rule.check(value).err())
            .map(|reason| Violation::new(&self.name, reason))
    }
}

/// A rule spanning more than one field.
#[derive(Debug, Clone)]
pub enum CrossFieldRule {
    /// `field` is required when `when` equals one of `values`.
    RequiredWhen {
        field: String,
        when: String,
        values: Vec<Value>,
    },
}

impl CrossFieldRule {
    #[must_use]
    pub fn required_when<I, V>(field: impl Into<String>, when: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        CrossFieldRule::RequiredWhen {
            field: field.into(),
            when: when.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn check(&self, params: &Params) -> Option<Violation> {
        match self {
            CrossFieldRule::RequiredWhen {
                field,
                when,
                values,
            } => {
                let trigger = params.get(when)?;
                if values.contains(trigger) && is_missing(params.get(field)) {
                    let shown = match trigger {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Some(Violation::new(
                        field,
                        format!("is required when '{when}' is '{shown}'"),
                    ))
                } else {
                    None
                }
            }
        }
    }
}

/// The complete rule set bound to one operation name.
#[derive(Debug, Clone)]
pub struct OperationSchema {
    operation: String,
    fields: Vec<FieldSpec>,
    cross_rules: Vec<CrossFieldRule>,
}

impl OperationSchema {
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            fields: Vec::new(),
            cross_rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    #[must_use]
    pub fn cross(mut self, rule: CrossFieldRule) -> Self {
        self.cross_rules.push(rule);
        self
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Runs every field and cross-field rule and returns all violations.
    ///
    /// A field gets at most one violation; cross-field rules are skipped for
    /// fields that already failed.
    #[must_use]
    pub fn check(&self, params: &Params) -> Vec<Violation> {
        let mut violations: Vec<Violation> =
            self.fields.iter().filter_map(|f| f.check(params)).collect();
        for rule in &self.cross_rules {
            if let Some(v) = rule.check(params) {
                if !violations.iter().any(|existing| existing.field == v.field) {
                    violations.push(v);
                }
            }
        }
        violations
    }
}

// ---------------------------------------------------------------------------
// Violations and errors
// ---------------------------------------------------------------------------

/// One violated field with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub reason: String,
}

impl Violation {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {}", self.field, self.reason)
    }
}

/// Caller-supplied parameters broke one or more rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation failed for '{operation}': {}", join_violations(.violations))]
pub struct ValidationError {
    pub operation: String,
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<&ValidationError> for ErrorRecord {
    fn from(err: &ValidationError) -> Self {
        ErrorRecord::new(ErrorCategory::Validation, err.to_string())
            .with_context("operation", err.operation.clone())
            .with_context("total_violations", err.violations.len())
            .with_context("violations", json!(err.violations))
    }
}

/// Failure of [`SchemaRegistry::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidateError {
    /// No schema is registered under this name: a gateway configuration fault.
    #[error("unknown operation '{name}'")]
    UnknownOperation { name: String },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

// ---------------------------------------------------------------------------
// SchemaRegistry
// ---------------------------------------------------------------------------

/// Static mapping from operation name to its schema, built at startup.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, OperationSchema>,
    strict: bool,
}

impl SchemaRegistry {
    /// Creates an empty, strict registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
            strict: true,
        }
    }

    /// When strict mode is off only the operation lookup is performed.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn register(&mut self, schema: OperationSchema) {
        self.schemas.insert(schema.operation.clone(), schema);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OperationSchema> {
        self.schemas.get(name)
    }

    /// Registered operation names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validates `params` for `name`, returning them unchanged on success.
    ///
    /// # Errors
    ///
    /// `ValidateError::UnknownOperation` if no schema exists for `name`;
    /// `ValidateError::Invalid` listing every violation otherwise.
    pub fn validate(&self, name: &str, params: Params) -> Result<Params, ValidateError> {
        let schema = self
            .schemas
            .get(name)
            .ok_or_else(|| ValidateError::UnknownOperation {
                name: name.to_string(),
            })?;
        if !self.strict {
            return Ok(params);
        }
        let violations = schema.check(&params);
        if violations.is_empty() {
            Ok(params)
        } else {
            Err(ValidationError {
                operation: name.to_string(),
                violations,
            }
            .into())
        }
    }

    /// Maps a validation failure into the taxonomy.
    #[must_use]
    pub fn to_record(&self, err: &ValidateError) -> ErrorRecord {
        match err {
            ValidateError::UnknownOperation { name } => {
                ErrorRecord::new(ErrorCategory::Configuration, err.to_string())
                    .with_context("operation", name.clone())
                    .with_context("known_operations", json!(self.names()))
            }
            ValidateError::Invalid(invalid) => ErrorRecord::from(invalid),
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
