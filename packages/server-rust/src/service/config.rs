use std::path::Path;
use std::time::Duration;

use gateway_core::error::DEFAULT_CONTEXT_MAX_LEN;
use gateway_core::{TimeoutOverrides, TimeoutTable};

use crate::network::ConfigError;

/// Service-side configuration for the operation gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Operation-class durations, default and hard ceiling.
    pub timeouts: TimeoutTable,
    /// Fixed slack added to an operation's budget for the outer wall-clock
    /// bound on `invoke`.
    pub dispatch_overhead: Duration,
    /// Tick of the in-flight sweep.
    pub sweep_interval: Duration,
    /// When `false` only the operation lookup is validated.
    pub strict_validation: bool,
    /// Longest string kept when parameters are copied into error context.
    pub context_max_len: usize,
    /// Average latency above which a connected session reports degraded.
    pub degraded_latency: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutTable::default(),
            dispatch_overhead: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(1),
            strict_validation: true,
            context_max_len: DEFAULT_CONTEXT_MAX_LEN,
            degraded_latency: Duration::from_secs(2),
        }
    }
}

impl GatewayConfig {
    /// Longest wall-clock time one invocation can take: the ceiling plus
    /// the dispatch overhead.
    #[must_use]
    pub fn max_invocation_time(&self) -> Duration {
        self.timeouts.ceiling() + self.dispatch_overhead
    }

    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate()?;
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero {
                key: "gateway.sweep_interval",
            });
        }
        if self.context_max_len == 0 {
            return Err(ConfigError::Zero {
                key: "gateway.context_max_len",
            });
        }
        Ok(())
    }
}

/// Reads JSON timeout overrides and merges them over the default table.
///
/// # Errors
///
/// Returns `ConfigError::File` if the file cannot be read or parsed, or the
/// table's own validation error.
pub fn load_timeout_table(path: &Path) -> Result<TimeoutTable, ConfigError> {
    let file_error = |reason: String| ConfigError::File {
        path: path.display().to_string(),
        reason,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    let overrides: TimeoutOverrides =
        serde_json::from_str(&raw).map_err(|e| file_error(e.to_string()))?;
    let table = TimeoutTable::default().merged(overrides);
    table.validate()?;
    Ok(table)
}
