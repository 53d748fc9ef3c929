//! Configuration for the remote editor session and the caller-facing HTTP
//! listener.

use std::time::Duration;

use gateway_core::{ErrorCategory, ErrorRecord};

/// Invalid configuration detected at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
    #[error("{key} is out of range: {detail}")]
    OutOfRange { key: &'static str, detail: String },
    #[error("invalid timeout table: {0}")]
    Timeouts(#[from] gateway_core::TimeoutTableError),
    #[error("cannot load {path}: {reason}")]
    File { path: String, reason: String },
    #[error("invalid operation catalog: {0}")]
    Catalog(String),
}

impl ConfigError {
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            ConfigError::Zero { key } | ConfigError::OutOfRange { key, .. } => key,
            ConfigError::Timeouts(_) => "timeouts",
            ConfigError::File { .. } => "timeouts_file",
            ConfigError::Catalog(_) => "catalog",
        }
    }
}

impl From<&ConfigError> for ErrorRecord {
    fn from(err: &ConfigError) -> Self {
        ErrorRecord::new(ErrorCategory::Configuration, err.to_string())
            .with_context("config_key", err.key())
    }
}

fn non_zero(key: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::Zero { key })
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Reconnection backoff: `base * 2^(n-1)` before the n-th retry, capped at
/// `max_delay`, for at most `max_attempts` connection attempts per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// # Errors
    ///
    /// Returns `ConfigError` if no attempt would ever be made or the delays
    /// are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                key: "retry.max_attempts",
            });
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::OutOfRange {
                key: "retry.base_delay",
                detail: format!(
                    "{}ms exceeds max_delay {}ms",
                    self.base_delay.as_millis(),
                    self.max_delay.as_millis()
                ),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

/// Endpoint and session-management settings for the remote editor process.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Bound on a single TCP connect plus its verification probe.
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Interval of the background liveness probe.
    pub probe_interval: Duration,
    /// Bound on a single probe round trip.
    pub probe_timeout: Duration,
    /// Consecutive probe failures after which the session is closed.
    pub probe_failure_threshold: u32,
    /// A session idle longer than this is probed before the next exchange.
    pub idle_probe_after: Duration,
    /// Largest frame accepted from the remote process, in bytes.
    pub max_frame_len: usize,
    /// Smoothing factor for the rolling latency average.
    pub latency_alpha: f64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6400,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            probe_failure_threshold: 3,
            idle_probe_after: Duration::from_secs(60),
            max_frame_len: 16 * 1024 * 1024,
            latency_alpha: 0.1,
        }
    }
}

impl RemoteConfig {
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::OutOfRange {
                key: "remote.host",
                detail: "host is empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::Zero { key: "remote.port" });
        }
        non_zero("remote.connect_timeout", self.connect_timeout)?;
        non_zero("remote.probe_interval", self.probe_interval)?;
        non_zero("remote.probe_timeout", self.probe_timeout)?;
        if self.probe_failure_threshold == 0 {
            return Err(ConfigError::Zero {
                key: "remote.probe_failure_threshold",
            });
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Zero {
                key: "remote.max_frame_len",
            });
        }
        if !(self.latency_alpha > 0.0 && self.latency_alpha <= 1.0) {
            return Err(ConfigError::OutOfRange {
                key: "remote.latency_alpha",
                detail: format!("{} is not in (0, 1]", self.latency_alpha),
            });
        }
        self.retry.validate()
    }
}

// ---------------------------------------------------------------------------
// HttpConfig
// ---------------------------------------------------------------------------

/// Slack between the longest invocation and the HTTP request timeout.
pub const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Caller-facing HTTP listener settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Outer bound on any HTTP request. Raised by `cover_invocations` so it
    /// never fires before an operation deadline.
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight operations.
    pub drain_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            request_timeout: Duration::from_secs(610),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    /// # Errors
    ///
    /// Returns `ConfigError` if a timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("http.request_timeout", self.request_timeout)?;
        non_zero("http.drain_timeout", self.drain_timeout)
    }

    /// Raises `request_timeout` to at least `longest + REQUEST_TIMEOUT_MARGIN`.
    /// Returns `true` if it changed.
    pub fn cover_invocations(&mut self, longest: Duration) -> bool {
        let floor = longest.saturating_add(REQUEST_TIMEOUT_MARGIN);
        if self.request_timeout < floor {
            self.request_timeout = floor;
            true
        } else {
            false
        }
    }
}
