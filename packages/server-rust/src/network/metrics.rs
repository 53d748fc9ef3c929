//! Connection metrics: monotonic exchange counters plus a rolling latency
//! average. Never reset for the lifetime of the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Timing {
    /// Exponential moving average of exchange latency, in milliseconds.
    avg_latency_ms: Option<f64>,
    connected_at: Option<Instant>,
    last_success: Option<Instant>,
}

/// Counters owned by the connection manager and read by health reporting.
#[derive(Debug)]
pub struct ConnectionMetrics {
    alpha: f64,
    total_attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
    timing: Mutex<Timing>,
}

/// Point-in-time copy of [`ConnectionMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: Option<f64>,
    /// Seconds since the current transport connected; `None` while disconnected.
    pub uptime_secs: Option<f64>,
    pub connects: u64,
    pub reconnects: u64,
    pub connect_failures: u64,
    pub last_success_ms_ago: Option<u64>,
}

impl ConnectionMetrics {
    /// `alpha` is the weight given to each new latency sample.
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            total_attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            timing: Mutex::new(Timing::default()),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);

        let sample = latency.as_secs_f64() * 1000.0;
        {
            let mut timing = self.timing.lock();
            timing.avg_latency_ms = Some(match timing.avg_latency_ms {
                Some(avg) => self.alpha * sample + (1.0 - self.alpha) * avg,
                None => sample,
            });
            timing.last_success = Some(Instant::now());
        }

        metrics::counter!("gateway_remote_exchanges_total", "outcome" => "success").increment(1);
        metrics::histogram!("gateway_remote_latency_seconds").record(latency.as_secs_f64());
    }

    pub fn record_failure(&self) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_remote_exchanges_total", "outcome" => "failure").increment(1);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.timing.lock().connected_at = Some(Instant::now());
        metrics::counter!("gateway_remote_connect_attempts_total", "outcome" => "success")
            .increment(1);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_remote_connect_attempts_total", "outcome" => "failure")
            .increment(1);
    }

    pub fn record_disconnect(&self) {
        self.timing.lock().connected_at = None;
    }

    #[must_use]
    pub fn average_latency(&self) -> Option<Duration> {
        self.timing
            .lock()
            .avg_latency_ms
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let (avg_latency_ms, uptime_secs, last_success_ms_ago) = {
            let timing = self.timing.lock();
            (
                timing.avg_latency_ms,
                timing
                    .connected_at
                    .map(|at| now.duration_since(at).as_secs_f64()),
                timing
                    .last_success
                    .map(|at| u64::try_from(now.duration_since(at).as_millis()).unwrap_or(u64::MAX)),
            )
        };
        let connects = self.connects.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            avg_latency_ms,
            uptime_secs,
            connects,
            reconnects: connects.saturating_sub(1),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            last_success_ms_ago,
        }
    }
}
