//! Static timeout-class table with a hard global ceiling.
//!
//! Durations are stored in milliseconds so the table can be loaded from a
//! plain JSON file. Every effective duration is clamped to `ceiling_ms`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog;
use crate::error::{ErrorCategory, ErrorRecord};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CEILING_MS: u64 = 600_000;
/// Largest accepted ceiling (one day).
pub const MAX_CEILING_MS: u64 = 86_400_000;

/// Effective timeout for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutBudget {
    /// Timeout class the duration came from; `None` when the default applied.
    pub class: Option<String>,
    /// Duration before clamping.
    pub configured: Duration,
    /// Duration actually enforced.
    pub duration: Duration,
    /// Whether `configured` exceeded the ceiling.
    pub clamped: bool,
}

/// Invalid timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutTableError {
    #[error("global timeout ceiling must be greater than zero")]
    ZeroCeiling,
    #[error("global timeout ceiling {ceiling_ms}ms exceeds the maximum of {max_ms}ms")]
    CeilingTooLarge { ceiling_ms: u64, max_ms: u64 },
    #[error("timeout '{name}' must be greater than zero")]
    ZeroDuration { name: String },
    #[error("operation '{operation}' refers to unknown timeout class '{class}'")]
    UnknownClass { operation: String, class: String },
}

impl From<&TimeoutTableError> for ErrorRecord {
    fn from(err: &TimeoutTableError) -> Self {
        ErrorRecord::new(ErrorCategory::Configuration, err.to_string())
            .with_context("config_key", "timeouts")
    }
}

/// Operation-class durations, operation bindings, default and ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutTable {
    /// Duration for operations with no class binding.
    pub default_ms: u64,
    /// Hard maximum; nothing configured or requested may exceed it.
    pub ceiling_ms: u64,
    /// Timeout class name -> duration.
    pub classes: BTreeMap<String, u64>,
    /// Operation name -> timeout class name.
    pub operations: BTreeMap<String, String>,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        let classes = [
            ("connection", 10_000),
            ("ping", 5_000),
            ("script_operation", 30_000),
            ("scene_operation", 60_000),
            ("gameobject_operation", 30_000),
            ("asset_operation", 45_000),
            ("editor_operation", 20_000),
            ("console_operation", 10_000),
            ("menu_operation", 15_000),
            ("shader_operation", 30_000),
            ("long_running", 300_000),
        ]
        .into_iter()
        .map(|(name, ms)| (name.to_string(), ms))
        .collect();

        let operations = catalog::OPERATION_CLASSES
            .iter()
            .map(|(op, class)| ((*op).to_string(), (*class).to_string()))
            .collect();

        Self {
            default_ms: DEFAULT_TIMEOUT_MS,
            ceiling_ms: DEFAULT_CEILING_MS,
            classes,
            operations,
        }
    }
}

/// Partial table read from a config file. Entries are merged over the
/// defaults instead of replacing whole maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutOverrides {
    pub default_ms: Option<u64>,
    pub ceiling_ms: Option<u64>,
    pub classes: BTreeMap<String, u64>,
    pub operations: BTreeMap<String, String>,
}

impl TimeoutTable {
    /// Applies `overrides` on top of this table.
    #[must_use]
    pub fn merged(mut self, overrides: TimeoutOverrides) -> Self {
        if let Some(ms) = overrides.default_ms {
            self.default_ms = ms;
        }
        if let Some(ms) = overrides.ceiling_ms {
            self.ceiling_ms = ms;
        }
        self.classes.extend(overrides.classes);
        self.operations.extend(overrides.operations);
        self
    }

    /// Checks the table for values that make the gateway unusable.
    ///
    /// Durations above the ceiling are not an error; they are clamped.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), TimeoutTableError> {
        if self.ceiling_ms == 0 {
            return Err(TimeoutTableError::ZeroCeiling);
        }
        if self.ceiling_ms > MAX_CEILING_MS {
            return Err(TimeoutTableError::CeilingTooLarge {
                ceiling_ms: self.ceiling_ms,
                max_ms: MAX_CEILING_MS,
            });
        }
        if self.default_ms == 0 {
            return Err(TimeoutTableError::ZeroDuration {
                name: "default".to_string(),
            });
        }
        if let Some((name, _)) = self.classes.iter().find(|(_, ms)| **ms == 0) {
            return Err(TimeoutTableError::ZeroDuration { name: name.clone() });
        }
        if let Some((operation, class)) = self
            .operations
            .iter()
            .find(|(_, class)| !self.classes.contains_key(*class))
        {
            return Err(TimeoutTableError::UnknownClass {
                operation: operation.clone(),
                class: class.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }

    /// Effective budget for `operation` using its class (or the default).
    #[must_use]
    pub fn budget_for(&self, operation: &str) -> TimeoutBudget {
        let class = self
            .operations
            .get(operation)
            .filter(|class| self.classes.contains_key(*class))
            .cloned()
            .or_else(|| {
                self.classes
                    .contains_key(operation)
                    .then(|| operation.to_string())
            });
        let configured_ms = class
            .as_ref()
            .and_then(|c| self.classes.get(c).copied())
            .unwrap_or(self.default_ms);
        self.clamp(class, Duration::from_millis(configured_ms))
    }

    /// Budget when the caller asked for a specific timeout. The request
    /// replaces the class duration but is still clamped to the ceiling.
    #[must_use]
    pub fn budget_with_request(&self, operation: &str, requested: Option<Duration>) -> TimeoutBudget {
        match requested {
            Some(requested) if !requested.is_zero() => {
                let class = self.budget_for(operation).class;
                self.clamp(class, requested)
            }
            _ => self.budget_for(operation),
        }
    }

    fn clamp(&self, class: Option<String>, configured: Duration) -> TimeoutBudget {
        let ceiling = self.ceiling();
        let clamped = configured > ceiling;
        TimeoutBudget {
            class,
            configured,
            duration: configured.min(ceiling),
            clamped,
        }
    }
}
