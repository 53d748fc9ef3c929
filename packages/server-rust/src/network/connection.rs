//! Connection manager: owns the single session to the remote editor process.
//!
//! Exchanges are serialized through a FIFO `tokio::sync::Mutex`; every wait
//! (queueing, connecting, backoff, awaiting the reply) is bounded by the
//! caller's deadline and its cancellation token. Session state transitions
//! only happen while holding that lock; a lock-free mirror serves readers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use gateway_core::{Params, RemoteCommand, RemoteReply, WireError};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::RemoteConfig;
use super::metrics::ConnectionMetrics;
use super::session::SessionState;
use super::transport::{frame, Connector, FramedTransport, TcpConnector};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Where in an exchange a deadline or cancellation struck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStage {
    /// Waiting behind other callers for the session.
    Queued,
    /// Connecting or sleeping between connect attempts.
    Connecting,
    /// Request written, reply outstanding.
    AwaitingReply,
}

impl ExchangeStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeStage::Queued => "queued",
            ExchangeStage::Connecting => "connecting",
            ExchangeStage::AwaitingReply => "awaiting_reply",
        }
    }
}

/// One connection attempt in a connect sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectAttempt {
    pub attempt: u32,
    /// `None` when the attempt connected.
    pub error: Option<String>,
    /// Backoff slept after this attempt before the next one.
    pub backoff_ms: Option<u64>,
}

/// Typed failure of [`ConnectionManager::send`].
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("could not connect to {endpoint} after {} attempts", attempts.len())]
    Connect {
        endpoint: String,
        attempts: Vec<ConnectAttempt>,
    },
    #[error("deadline exceeded while {} after {}ms", stage.as_str(), waited.as_millis())]
    Timeout {
        stage: ExchangeStage,
        waited: Duration,
    },
    #[error("exchange cancelled while {}", stage.as_str())]
    Cancelled { stage: ExchangeStage },
    #[error("connection dropped: {reason}")]
    Dropped { reason: String },
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },
    /// Well-formed reply reporting that the operation itself failed.
    #[error("remote operation failed: {message}")]
    Remote { message: String },
    #[error(transparent)]
    Encode(#[from] WireError),
    #[error("connection manager is shut down")]
    Closed,
}

/// Failure of a single request/reply round trip on an open transport.
#[derive(Debug, thiserror::Error)]
enum ExchangeFault {
    #[error("{0}")]
    Dropped(String),
    #[error("{0}")]
    Protocol(String),
    #[error(transparent)]
    Encode(#[from] WireError),
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

enum Interrupt {
    Deadline,
    Cancelled,
}

impl Interrupt {
    fn into_error(self, stage: ExchangeStage, waited: Duration) -> ExchangeError {
        match self {
            Interrupt::Deadline => ExchangeError::Timeout { stage, waited },
            Interrupt::Cancelled => ExchangeError::Cancelled { stage },
        }
    }
}

/// Runs `fut` until it completes, `deadline` passes, or `cancel` fires.
async fn bounded<F: Future>(
    deadline: Instant,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Interrupt::Cancelled),
        result = tokio::time::timeout_at(deadline, fut) => result.map_err(|_| Interrupt::Deadline),
    }
}

/// Writes `command` and reads frames until the reply with the same id
/// arrives. Replies to earlier, abandoned exchanges are discarded.
async fn round_trip(
    transport: &mut FramedTransport,
    command: &RemoteCommand,
) -> Result<RemoteReply, ExchangeFault> {
    let payload = command.encode()?;
    let max = transport.codec().max_frame_length();
    if payload.len() > max {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max,
        }
        .into());
    }
    transport
        .send(Bytes::from(payload))
        .await
        .map_err(|e| ExchangeFault::Dropped(e.to_string()))?;
    loop {
        let frame = match transport.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(ExchangeFault::Protocol(e.to_string()))
            }
            Some(Err(e)) => return Err(ExchangeFault::Dropped(e.to_string())),
            None => {
                return Err(ExchangeFault::Dropped(
                    "remote closed the connection".to_string(),
                ))
            }
        };
        let reply =
            RemoteReply::decode(&frame).map_err(|e| ExchangeFault::Protocol(e.to_string()))?;
        if reply.id() == command.id {
            return Ok(reply);
        }
        debug!(
            expected = command.id,
            received = reply.id(),
            "discarding stale reply"
        );
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Result of a background liveness probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Healthy { latency: Duration },
    Failed { reason: String, probe_failures: u32 },
    /// An exchange holds the session; its own outcome is evidence enough.
    Busy,
    /// No transport is open or the manager is shut down.
    Skipped,
}

#[derive(Default)]
struct Session {
    transport: Option<FramedTransport>,
    last_exchange: Option<Instant>,
}

/// Owns the session to the remote process. Share it behind an `Arc`.
pub struct ConnectionManager {
    config: RemoteConfig,
    connector: Arc<dyn Connector>,
    session: Mutex<Session>,
    state: ArcSwap<SessionState>,
    consecutive_failures: AtomicU32,
    probe_failures: AtomicU32,
    closed: AtomicBool,
    next_id: AtomicU64,
    metrics: ConnectionMetrics,
    connect_history: parking_lot::Mutex<Vec<ConnectAttempt>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: RemoteConfig, connector: Arc<dyn Connector>) -> Self {
        let metrics = ConnectionMetrics::new(config.latency_alpha);
        Self {
            config,
            connector,
            session: Mutex::new(Session::default()),
            state: ArcSwap::from_pointee(SessionState::Disconnected),
            consecutive_failures: AtomicU32::new(0),
            probe_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            metrics,
            connect_history: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Manager connecting over TCP to `config.endpoint()`.
    #[must_use]
    pub fn tcp(config: RemoteConfig) -> Self {
        let connector = TcpConnector::new(config.endpoint());
        Self::new(config, Arc::new(connector))
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        **self.state.load()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Failed probes since the last successful exchange or probe. Only
    /// these count towards `probe_failure_threshold`.
    #[must_use]
    pub fn probe_failures(&self) -> u32 {
        self.probe_failures.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Attempts of the most recent connect sequence.
    #[must_use]
    pub fn last_connect_attempts(&self) -> Vec<ConnectAttempt> {
        self.connect_history.lock().clone()
    }

    /// Sends one command and waits for its reply.
    ///
    /// Connects (with backoff) if no transport is open and probes first if
    /// the session has been idle. A dropped exchange on a healthy session is
    /// retried once on a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns an [`ExchangeError`] describing the failed stage. The
    /// operation's own failure reported by the remote is `Remote`.
    pub async fn send(
        &self,
        command_type: &str,
        params: Params,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Value, ExchangeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExchangeError::Closed);
        }
        let started = Instant::now();
        let mut session = bounded(deadline, cancel, self.session.lock())
            .await
            .map_err(|i| i.into_error(ExchangeStage::Queued, started.elapsed()))?;
        if self.closed.load(Ordering::Acquire) {
            return Err(ExchangeError::Closed);
        }

        self.probe_if_idle(&mut session, deadline, cancel).await;

        let command = RemoteCommand::new(self.next_id(), command_type, params);
        self.ensure_connected(&mut session, deadline, cancel, started)
            .await?;
        let healthy = self.state() == SessionState::Connected;
        let reply = match self
            .exchange(&mut session, &command, deadline, cancel, started)
            .await
        {
            Err(ExchangeError::Dropped { reason }) if healthy => {
                warn!(%reason, command = %command.command_type, "exchange dropped on healthy session, retrying once");
                self.ensure_connected(&mut session, deadline, cancel, started)
                    .await?;
                self.exchange(&mut session, &command, deadline, cancel, started)
                    .await?
            }
            other => other?,
        };

        match reply {
            RemoteReply::Success { result, .. } => Ok(result),
            RemoteReply::Error { error, .. } => Err(ExchangeError::Remote { message: error }),
            RemoteReply::Pong { .. } => Err(ExchangeError::Protocol {
                reason: format!("pong received for '{}'", command.command_type),
            }),
        }
    }

    /// Background liveness probe. Skipped while an exchange holds the
    /// session or when no transport is open.
    pub async fn probe(&self) -> ProbeOutcome {
        if self.closed.load(Ordering::Acquire) {
            return ProbeOutcome::Skipped;
        }
        let Ok(mut session) = self.session.try_lock() else {
            return ProbeOutcome::Busy;
        };
        if session.transport.is_none() {
            return ProbeOutcome::Skipped;
        }
        let deadline = Instant::now() + self.config.probe_timeout;
        match self
            .probe_locked(&mut session, deadline, &CancellationToken::new())
            .await
        {
            Ok(latency) => ProbeOutcome::Healthy { latency },
            Err(reason) => ProbeOutcome::Failed {
                reason,
                probe_failures: self.probe_failures(),
            },
        }
    }

    /// Closes the session and refuses further exchanges. Waits for the
    /// exchange currently holding the session, if any.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut session = self.session.lock().await;
        if session.transport.is_some() {
            self.close_transport(&mut session, "shutdown");
        }
        info!(endpoint = %self.endpoint(), "connection manager shut down");
    }

    // -- internals ----------------------------------------------------------

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.swap(Arc::new(next));
        if *previous != next {
            info!(from = %previous, to = %next, "session state changed");
        }
    }

    fn mark_healthy(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.probe_failures.store(0, Ordering::Release);
        self.set_state(SessionState::Connected);
    }

    fn note_failure(&self) -> u32 {
        self.metrics.record_failure();
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn close_transport(&self, session: &mut Session, reason: &str) {
        session.transport = None;
        self.metrics.record_disconnect();
        self.set_state(SessionState::Disconnected);
        info!(reason, "session transport closed");
    }

    async fn probe_if_idle(
        &self,
        session: &mut Session,
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        let idle = session
            .last_exchange
            .is_some_and(|at| at.elapsed() >= self.config.idle_probe_after);
        if session.transport.is_none() || !idle {
            return;
        }
        debug!("session idle, probing before use");
        let probe_deadline = deadline.min(Instant::now() + self.config.probe_timeout);
        let _ = self.probe_locked(session, probe_deadline, cancel).await;
    }

    /// Pings over the open transport. Probe failures count towards the
    /// threshold that closes the session; a dead transport is closed at once.
    async fn probe_locked(
        &self,
        session: &mut Session,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Duration, String> {
        let Some(transport) = session.transport.as_mut() else {
            return Err("no transport".to_string());
        };
        let ping = RemoteCommand::ping(self.next_id());
        let sent = Instant::now();
        let (reason, transport_dead) = match bounded(deadline, cancel, round_trip(transport, &ping)).await {
            Ok(Ok(reply)) if reply.is_pong() => {
                let latency = sent.elapsed();
                self.metrics.record_success(latency);
                session.last_exchange = Some(Instant::now());
                self.mark_healthy();
                debug!(latency_ms = millis(latency), "probe succeeded");
                return Ok(latency);
            }
            Ok(Ok(_)) => ("probe answered without pong".to_string(), false),
            Ok(Err(fault @ (ExchangeFault::Dropped(_) | ExchangeFault::Protocol(_)))) => {
                (fault.to_string(), true)
            }
            Ok(Err(fault)) => (fault.to_string(), false),
            Err(Interrupt::Deadline) => ("probe timed out".to_string(), false),
            Err(Interrupt::Cancelled) => ("probe cancelled".to_string(), false),
        };

        self.note_failure();
        let failures = self.probe_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(%reason, probe_failures = failures, "probe failed");
        if transport_dead || failures >= self.config.probe_failure_threshold {
            self.close_transport(session, "probe failures");
        } else {
            self.set_state(SessionState::Degraded);
        }
        Err(reason)
    }

    async fn exchange(
        &self,
        session: &mut Session,
        command: &RemoteCommand,
        deadline: Instant,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RemoteReply, ExchangeError> {
        let Some(transport) = session.transport.as_mut() else {
            return Err(ExchangeError::Dropped {
                reason: "no transport".to_string(),
            });
        };
        let sent = Instant::now();
        match bounded(deadline, cancel, round_trip(transport, command)).await {
            Ok(Ok(reply)) => {
                self.metrics.record_success(sent.elapsed());
                session.last_exchange = Some(Instant::now());
                self.mark_healthy();
                Ok(reply)
            }
            Ok(Err(ExchangeFault::Encode(e))) => {
                self.metrics.record_failure();
                warn!(command = %command.command_type, error = %e, "command could not be encoded");
                Err(ExchangeError::Encode(e))
            }
            Ok(Err(ExchangeFault::Dropped(reason))) => {
                self.note_failure();
                self.close_transport(session, "exchange dropped");
                Err(ExchangeError::Dropped { reason })
            }
            Ok(Err(ExchangeFault::Protocol(reason))) => {
                self.note_failure();
                self.close_transport(session, "protocol violation");
                Err(ExchangeError::Protocol { reason })
            }
            Err(interrupt) => {
                let failures = self.note_failure();
                self.set_state(SessionState::Degraded);
                warn!(
                    command = %command.command_type,
                    consecutive_failures = failures,
                    "no reply before deadline, session degraded"
                );
                Err(interrupt.into_error(ExchangeStage::AwaitingReply, started.elapsed()))
            }
        }
    }

    /// Opens and verifies a transport if none is open, retrying with backoff.
    async fn ensure_connected(
        &self,
        session: &mut Session,
        deadline: Instant,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), ExchangeError> {
        if session.transport.is_some() {
            return Ok(());
        }
        self.set_state(SessionState::Connecting);
        let endpoint = self.endpoint();
        let policy = &self.config.retry;
        let mut history = Vec::new();
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            let reason = match bounded(deadline, cancel, self.open_verified()).await {
                Err(interrupt) => {
                    break Err(interrupt.into_error(ExchangeStage::Connecting, started.elapsed()))
                }
                Ok(Ok(transport)) => {
                    history.push(ConnectAttempt {
                        attempt,
                        error: None,
                        backoff_ms: None,
                    });
                    session.transport = Some(transport);
                    session.last_exchange = Some(Instant::now());
                    self.metrics.record_connect();
                    self.set_state(SessionState::Connected);
                    info!(%endpoint, attempt, "connected to remote");
                    break Ok(());
                }
                Ok(Err(reason)) => reason,
            };

            self.metrics.record_connect_failure();
            let backoff = (attempt < policy.max_attempts).then(|| policy.delay_after(attempt));
            warn!(
                %endpoint,
                attempt,
                error = %reason,
                backoff = ?backoff,
                "connect attempt failed"
            );
            history.push(ConnectAttempt {
                attempt,
                error: Some(reason),
                backoff_ms: backoff.map(millis),
            });
            let Some(delay) = backoff else {
                break Err(ExchangeError::Connect {
                    endpoint: endpoint.clone(),
                    attempts: history.clone(),
                });
            };
            if let Err(interrupt) = bounded(deadline, cancel, tokio::time::sleep(delay)).await {
                break Err(interrupt.into_error(ExchangeStage::Connecting, started.elapsed()));
            }
        };

        if result.is_err() {
            self.note_failure();
            self.set_state(SessionState::Disconnected);
        }
        *self.connect_history.lock() = history;
        result
    }

    /// One connect attempt: open the stream, frame it, and verify it with a
    /// probe, all within `connect_timeout`.
    async fn open_verified(&self) -> Result<FramedTransport, String> {
        let attempt = async {
            let stream = self.connector.connect().await.map_err(|e| e.to_string())?;
            let mut transport = frame(stream, self.config.max_frame_len);
            let ping = RemoteCommand::ping(self.next_id());
            match round_trip(&mut transport, &ping).await {
                Ok(reply) if reply.is_pong() => Ok(transport),
                Ok(_) => Err("verification probe was not answered with pong".to_string()),
                Err(fault) => Err(format!("verification probe failed: {fault}")),
            }
        };
        match tokio::time::timeout(self.config.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "connect timed out after {}ms",
                self.config.connect_timeout.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::test_helpers::{responsive, with_commands, Reply, ScriptedConnector};

    fn manager(connector: ScriptedConnector) -> (Arc<ConnectionManager>, Arc<ScriptedConnector>) {
        let connector = Arc::new(connector);
        let dyn_connector: Arc<dyn Connector> = connector.clone();
        (
            Arc::new(ConnectionManager::new(RemoteConfig::default(), dyn_connector)),
            connector,
        )
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test(start_paused = true)]
    async fn send_connects_and_returns_result() {
        let (mgr, connector) = manager(ScriptedConnector::new(responsive()));
        assert_eq!(mgr.state(), SessionState::Disconnected);

        let result = mgr
            .send("manage_scene", params(json!({"action": "load"})), in_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["type"], "manage_scene");
        assert_eq!(result["params"]["action"], "load");
        assert_eq!(mgr.state(), SessionState::Connected);
        assert_eq!(connector.attempts(), 1);

        let snap = mgr.metrics().snapshot();
        // verification probe is not counted; the exchange is
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_reply_is_typed() {
        let (mgr, _) = manager(ScriptedConnector::new(with_commands(|_| {
            Reply::Error("Scene not found".to_string())
        })));
        let err = mgr
            .send("manage_scene", Params::new(), in_secs(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Remote { ref message } if message == "Scene not found"));
        assert_eq!(mgr.state(), SessionState::Connected);
        assert_eq!(mgr.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_then_success_on_fourth_attempt() {
        let (mgr, connector) = manager(ScriptedConnector::refusing(3, responsive()));
        let start = Instant::now();

        mgr.send("read_console", Params::new(), in_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(connector.attempts(), 4);
        let attempts = mgr.last_connect_attempts();
        let backoffs: Vec<Option<u64>> = attempts.iter().map(|a| a.backoff_ms).collect();
        assert_eq!(backoffs, vec![Some(1000), Some(2000), Some(4000), None]);
        assert!(attempts[3].error.is_none());
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert!(start.elapsed() < Duration::from_secs(8));
        assert_eq!(mgr.metrics().snapshot().connect_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_carry_attempt_history() {
        let (mgr, connector) = manager(ScriptedConnector::refusing(u32::MAX, responsive()));

        let err = mgr
            .send("read_console", Params::new(), in_secs(120), &CancellationToken::new())
            .await
            .unwrap_err();

        let ExchangeError::Connect { attempts, endpoint } = err else {
            panic!("expected connect error, got {err:?}");
        };
        assert_eq!(endpoint, "fake-editor");
        assert_eq!(attempts.len(), 5);
        assert_eq!(connector.attempts(), 5);
        assert!(attempts.iter().all(|a| a.error.is_some()));
        assert_eq!(attempts[4].backoff_ms, None);
        assert_eq!(mgr.state(), SessionState::Disconnected);
        assert_eq!(mgr.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleep_respects_deadline() {
        let (mgr, _) = manager(ScriptedConnector::refusing(u32::MAX, responsive()));
        let start = Instant::now();

        let err = mgr
            .send("read_console", Params::new(), in_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExchangeError::Timeout {
                stage: ExchangeStage::Connecting,
                ..
            }
        ));
        assert!(start.elapsed() <= Duration::from_secs(5));
        assert_eq!(mgr.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_exchange_times_out_and_degrades() {
        let (mgr, _) = manager(ScriptedConnector::new(with_commands(|_| Reply::Silent)));
        let start = Instant::now();

        let err = mgr
            .send("manage_asset", Params::new(), in_secs(3), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExchangeError::Timeout {
                stage: ExchangeStage::AwaitingReply,
                ..
            }
        ));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_millis(3100));
        assert_eq!(mgr.state(), SessionState::Degraded);
        assert_eq!(mgr.consecutive_failures(), 1);
        assert_eq!(mgr.metrics().snapshot().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_discarded_by_next_exchange() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (mgr, _) = manager(ScriptedConnector::new(with_commands(move |cmd| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::After(Duration::from_secs(5), Box::new(Reply::Value(json!("late"))))
            } else {
                Reply::Value(json!(cmd.command_type))
            }
        })));

        let err = mgr
            .send("first", Params::new(), in_secs(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout { .. }));

        let result = mgr
            .send("second", Params::new(), in_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, json!("second"));
        assert_eq!(mgr.state(), SessionState::Connected);
        assert_eq!(mgr.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_caller_times_out_without_blocking_others() {
        let (mgr, _) = manager(ScriptedConnector::new(with_commands(|cmd| {
            if cmd.command_type == "slow" {
                Reply::After(Duration::from_secs(4), Box::new(Reply::Echo))
            } else {
                Reply::Echo
            }
        })));

        let slow = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.send("slow", Params::new(), in_secs(10), &CancellationToken::new())
                    .await
            })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued = mgr
            .send("impatient", Params::new(), in_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            queued,
            ExchangeError::Timeout {
                stage: ExchangeStage::Queued,
                ..
            }
        ));

        assert!(slow.await.unwrap().is_ok());
        let after = mgr
            .send("after", Params::new(), in_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(after["type"], "after");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_exchange() {
        let (mgr, _) = manager(ScriptedConnector::new(with_commands(|_| Reply::Silent)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = mgr
            .send("manage_script", Params::new(), in_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Cancelled {
                stage: ExchangeStage::AwaitingReply
            }
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_exchange_on_healthy_session_is_retried_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (mgr, connector) = manager(ScriptedConnector::new(with_commands(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Hangup
            } else {
                Reply::Echo
            }
        })));

        let result = mgr
            .send("manage_shader", Params::new(), in_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["type"], "manage_shader");
        assert_eq!(connector.attempts(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_exchange_on_degraded_session_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (mgr, connector) = manager(ScriptedConnector::new(with_commands(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Reply::Silent,
                _ => Reply::Hangup,
            }
        })));

        let _ = mgr
            .send("a", Params::new(), in_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(mgr.state(), SessionState::Degraded);

        let err = mgr
            .send("b", Params::new(), in_secs(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Dropped { .. }));
        assert_eq!(connector.attempts(), 1);
        assert_eq!(mgr.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failures_close_session_at_threshold() {
        let answer_pings = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&answer_pings);
        let (mgr, _) = manager(ScriptedConnector::new(Arc::new(move |cmd: &RemoteCommand| {
            if cmd.command_type != gateway_core::wire::PING {
                Reply::Echo
            } else if flag.load(Ordering::SeqCst) {
                Reply::Pong
            } else {
                Reply::Silent
            }
        })));

        assert_eq!(mgr.probe().await, ProbeOutcome::Skipped);
        mgr.send("x", Params::new(), in_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(mgr.probe().await, ProbeOutcome::Healthy { .. }));

        answer_pings.store(false, Ordering::SeqCst);
        for expected in 1..=2 {
            let outcome = mgr.probe().await;
            assert!(matches!(
                outcome,
                ProbeOutcome::Failed { probe_failures, .. } if probe_failures == expected
            ));
            assert_eq!(mgr.state(), SessionState::Degraded);
        }
        assert!(matches!(mgr.probe().await, ProbeOutcome::Failed { .. }));
        assert_eq!(mgr.state(), SessionState::Disconnected);
        assert_eq!(mgr.consecutive_failures(), 3);
        assert_eq!(mgr.probe_failures(), 3);
        assert_eq!(mgr.probe().await, ProbeOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_timeouts_do_not_count_towards_probe_threshold() {
        let answer_pings = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&answer_pings);
        let (mgr, connector) = manager(ScriptedConnector::new(Arc::new(move |cmd: &RemoteCommand| {
            if cmd.command_type == gateway_core::wire::PING && flag.load(Ordering::SeqCst) {
                Reply::Pong
            } else {
                Reply::Silent
            }
        })));

        for name in ["slow_a", "slow_b"] {
            let err = mgr
                .send(name, Params::new(), in_secs(1), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ExchangeError::Timeout { .. }));
        }
        assert_eq!(mgr.consecutive_failures(), 2);
        assert_eq!(mgr.probe_failures(), 0);

        answer_pings.store(false, Ordering::SeqCst);
        assert!(matches!(
            mgr.probe().await,
            ProbeOutcome::Failed { probe_failures: 1, .. }
        ));
        assert_eq!(mgr.consecutive_failures(), 3);
        assert_eq!(mgr.state(), SessionState::Degraded);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_command_fails_without_closing_the_session() {
        let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::new(responsive()));
        let config = RemoteConfig {
            max_frame_len: 512,
            ..RemoteConfig::default()
        };
        let mgr = ConnectionManager::new(config, connector);

        let err = mgr
            .send(
                "create_script",
                params(json!({"contents": "x".repeat(1024)})),
                in_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExchangeError::Encode(WireError::FrameTooLarge { max: 512, .. })
        ));
        assert_eq!(mgr.state(), SessionState::Connected);
        assert_eq!(mgr.consecutive_failures(), 0);
        let snap = mgr.metrics().snapshot();
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.total_attempts, 1);
        assert_eq!(snap.reconnects, 0);

        mgr.send("after", Params::new(), in_secs(5), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_is_skipped_while_exchange_in_flight() {
        let (mgr, _) = manager(ScriptedConnector::new(with_commands(|_| {
            Reply::After(Duration::from_secs(2), Box::new(Reply::Echo))
        })));
        let busy = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.send("slow", Params::new(), in_secs(10), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.probe().await, ProbeOutcome::Busy);
        assert!(busy.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_probed_before_use() {
        let pings = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&pings);
        let (mgr, _) = manager(ScriptedConnector::new(Arc::new(move |cmd: &RemoteCommand| {
            if cmd.command_type == gateway_core::wire::PING {
                counter.fetch_add(1, Ordering::SeqCst);
                Reply::Pong
            } else {
                Reply::Echo
            }
        })));

        mgr.send("a", Params::new(), in_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        // one verification probe on connect
        assert_eq!(pings.load(Ordering::SeqCst), 1);

        tokio::time::advance(mgr.config().idle_probe_after + Duration::from_secs(1)).await;
        mgr.send("b", Params::new(), in_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_exchanges() {
        let (mgr, _) = manager(ScriptedConnector::new(responsive()));
        mgr.send("a", Params::new(), in_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        mgr.shutdown().await;
        assert_eq!(mgr.state(), SessionState::Disconnected);
        let err = mgr
            .send("b", Params::new(), in_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Closed));
        assert_eq!(mgr.probe().await, ProbeOutcome::Skipped);
    }
}
