//! Network module with deferred startup lifecycle.
//!
//! `new()` wires shared state, `start()` binds the TCP listener, and
//! `serve()` accepts HTTP requests until shutdown, then drains.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::HttpConfig;
use super::handlers::{routes, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::OperationGateway;

/// Manages the caller-facing HTTP server lifecycle.
///
/// 1. `new()` -- allocates the shutdown controller
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- accepts requests until the shutdown future resolves
pub struct NetworkModule {
    config: HttpConfig,
    listener: Option<TcpListener>,
    gateway: Arc<OperationGateway>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// The request timeout is raised when needed so it outlasts the
    /// gateway's longest invocation.
    #[must_use]
    pub fn new(mut config: HttpConfig, gateway: Arc<OperationGateway>) -> Self {
        let longest = gateway.config().max_invocation_time();
        if config.cover_invocations(longest) {
            let request_timeout_ms =
                u64::try_from(config.request_timeout.as_millis()).unwrap_or(u64::MAX);
            info!(
                request_timeout_ms,
                "HTTP request timeout raised above the operation ceiling"
            );
        }
        Self {
            config,
            listener: None,
            gateway,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            gateway: Arc::clone(&self.gateway),
            shutdown: Arc::clone(&self.shutdown),
            start_time: Instant::now(),
        };
        routes()
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the TCP listener and returns the bound port, which differs from
    /// the configured one when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "HTTP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// On the shutdown signal the controller moves to Draining and the
    /// gateway refuses new invocations. Once open HTTP requests finish, the
    /// remaining in-flight operations get up to `drain_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();

        let ctrl = Arc::clone(&self.shutdown);
        let gateway = Arc::clone(&self.gateway);
        let signal = async move {
            shutdown.await;
            info!("shutdown signal received, draining");
            ctrl.trigger_shutdown();
            gateway.stop_accepting();
        };

        self.shutdown.set_ready();
        info!("serving HTTP");

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        self.shutdown.trigger_shutdown();
        self.gateway.stop_accepting();

        let gateway = Arc::clone(&self.gateway);
        let drained = self
            .shutdown
            .wait_for_drain(self.config.drain_timeout, || gateway.in_flight_count())
            .await;
        if drained {
            info!("all in-flight operations drained");
        } else {
            warn!(
                in_flight = self.gateway.in_flight_count(),
                "drain timeout expired with operations still in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use gateway_core::RemoteCommand;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tower::ServiceExt;

    use super::*;
    use crate::network::shutdown::HealthState;
    use crate::network::test_helpers::{self, Reply};
    use crate::service::GatewayConfig;

    fn module() -> NetworkModule {
        NetworkModule::new(
            HttpConfig::default(),
            test_helpers::gateway(test_helpers::responsive()),
        )
    }

    async fn get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = module();
        assert!(module.listener.is_none());
        assert_eq!(module.shutdown_controller().health_state(), HealthState::Starting);
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = module();
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn raised_ceiling_still_answers_with_a_timeout_outcome() {
        let mut config = GatewayConfig::default();
        config.timeouts.ceiling_ms = 1_200_000;
        config
            .timeouts
            .classes
            .insert("editor_operation".to_string(), 900_000);
        let silent = test_helpers::with_commands(|_: &RemoteCommand| Reply::Silent);
        let module = NetworkModule::new(
            HttpConfig::default(),
            test_helpers::gateway_with_config(config, silent),
        );
        assert!(module.config.request_timeout > Duration::from_secs(1_200));

        let request = Request::post("/operations/manage_editor")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"action": "get_state"}"#))
            .unwrap();
        let response = module.build_router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["category"], "timeout");
        assert_eq!(body["error"]["context"]["timeout_ms"], 900_000);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module()
            .serve(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serves_until_shutdown_then_stops() {
        let mut module = module();
        let port = module.start().await.unwrap();
        let controller = module.shutdown_controller();
        let gateway = Arc::clone(&module.gateway);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(async move {
            let _ = rx.await;
        }));

        let live = get(port, "/health/live").await;
        assert!(live.starts_with("HTTP/1.1 200"));
        let ready = get(port, "/health/ready").await;
        assert!(ready.starts_with("HTTP/1.1 200"));
        let listing = get(port, "/operations").await;
        assert!(listing.contains("manage_scene"));

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(controller.health_state(), HealthState::Stopped);
        assert!(!gateway.is_accepting());
    }
}
