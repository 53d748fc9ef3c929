//! Background workers: the in-flight deadline sweep and the session
//! liveness probe.
//!
//! Both run on a `BackgroundWorker` that drives a `BackgroundRunnable` on a
//! periodic tick until stopped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::network::connection::{ConnectionManager, ProbeOutcome};
use crate::service::registry::TimeoutRegistry;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Periodic job executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// Name used in log lines.
    fn name(&self) -> &'static str;

    /// Called on each tick interval.
    async fn on_tick(&mut self);

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned background task driving one runnable.
pub struct BackgroundWorker {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Spawns the worker. The first tick fires one full `tick` after start.
    pub fn start<R: BackgroundRunnable>(mut runnable: R, tick: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick_interval = tokio::time::interval(tick);
            tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick_interval.tick().await;
            debug!(worker = runnable.name(), tick = ?tick, "worker started");

            loop {
                tokio::select! {
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
            debug!(worker = runnable.name(), "worker stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Stop the worker, waiting for its task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// SweepRunnable
// ---------------------------------------------------------------------------

/// Cancels in-flight operations whose deadline has passed.
pub struct SweepRunnable {
    registry: Arc<TimeoutRegistry>,
}

impl SweepRunnable {
    #[must_use]
    pub fn new(registry: Arc<TimeoutRegistry>) -> Self {
        Self { registry }
    }

    fn sweep(&self) {
        let swept = self.registry.sweep(Instant::now());
        if swept > 0 {
            debug!(swept, "deadline sweep cancelled expired operations");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for SweepRunnable {
    fn name(&self) -> &'static str {
        "deadline-sweep"
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }

    async fn shutdown(&mut self) {
        self.sweep();
    }
}

// ---------------------------------------------------------------------------
// ProbeRunnable
// ---------------------------------------------------------------------------

/// Pings the remote process on every tick while a session is open.
pub struct ProbeRunnable {
    connection: Arc<ConnectionManager>,
}

impl ProbeRunnable {
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    async fn probe(&self) {
        match self.connection.probe().await {
            ProbeOutcome::Healthy { latency } => {
                debug!(latency = ?latency, "liveness probe ok");
            }
            ProbeOutcome::Failed {
                reason,
                probe_failures,
            } => {
                warn!(%reason, probe_failures, "liveness probe failed");
            }
            ProbeOutcome::Busy | ProbeOutcome::Skipped => {}
        }
    }
}

#[async_trait]
impl BackgroundRunnable for ProbeRunnable {
    fn name(&self) -> &'static str {
        "liveness-probe"
    }

    async fn on_tick(&mut self) {
        self.probe().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
