//! The operation gateway: the single entry point that turns a named request
//! into exactly one terminal outcome.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_core::{
    catalog, summarize_parameters, OperationRequest, Outcome, Params, SchemaRegistry,
};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::info;

use crate::network::config::{ConfigError, RemoteConfig};
use crate::network::connection::ConnectionManager;
use crate::service::classify::{
    classify, classify_overrun, classify_refused, classify_unexpected, FaultContext,
    CALLER_VISIBLE_KEYS,
};
use crate::service::config::GatewayConfig;
use crate::service::dispatch::RemoteDispatcher;
use crate::service::health::{HealthReport, HealthReporter, HealthStatus};
use crate::service::middleware::{build_operation_pipeline, OperationPipeline};
use crate::service::operation::OperationCall;
use crate::service::registry::TimeoutRegistry;

/// One entry of the operation listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationInfo {
    pub name: String,
    pub timeout_class: Option<String>,
    pub timeout_ms: u64,
    pub configured_timeout_ms: u64,
    pub clamped: bool,
    pub fields: Vec<String>,
}

/// Aborts the spawned pipeline task if the invoking future is dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub struct OperationGateway {
    config: GatewayConfig,
    schemas: Arc<SchemaRegistry>,
    registry: Arc<TimeoutRegistry>,
    connection: Arc<ConnectionManager>,
    pipeline: OperationPipeline,
    health: HealthReporter,
    accepting: AtomicBool,
}

impl OperationGateway {
    /// Wires the pipeline over `schemas` and `connection`.
    ///
    /// Strict validation follows `config.strict_validation`.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        schemas: SchemaRegistry,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        let schemas = Arc::new(schemas.with_strict(config.strict_validation));
        let registry = Arc::new(TimeoutRegistry::new(config.timeouts.clone()));
        let pipeline = build_operation_pipeline(
            Arc::clone(&schemas),
            Arc::clone(&registry),
            RemoteDispatcher::new(Arc::clone(&connection)),
        );
        let health = HealthReporter::new(
            Arc::clone(&connection),
            Arc::clone(&registry),
            config.degraded_latency,
        );
        Self {
            config,
            schemas,
            registry,
            connection,
            pipeline,
            health,
            accepting: AtomicBool::new(true),
        }
    }

    /// Validates both configs and builds a gateway over the default editor
    /// catalog and a TCP session.
    ///
    /// # Errors
    ///
    /// Returns the first configuration fault found.
    pub fn from_config(config: GatewayConfig, remote: RemoteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        remote.validate()?;
        let schemas =
            catalog::default_registry().map_err(|e| ConfigError::Catalog(e.to_string()))?;
        let connection = Arc::new(ConnectionManager::tcp(remote));
        Ok(Self::new(config, schemas, connection))
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TimeoutRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    #[must_use]
    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.registry.in_flight_count()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Every registered operation with its effective timeout budget.
    #[must_use]
    pub fn operations(&self) -> Vec<OperationInfo> {
        self.schemas
            .names()
            .into_iter()
            .map(|name| {
                let budget = self.registry.budget(name, None);
                let fields = self
                    .schemas
                    .get(name)
                    .map(|schema| schema.fields().iter().map(|f| f.name().to_string()).collect())
                    .unwrap_or_default();
                OperationInfo {
                    name: name.to_string(),
                    timeout_class: budget.class,
                    timeout_ms: millis(budget.duration),
                    configured_timeout_ms: millis(budget.configured),
                    clamped: budget.clamped,
                    fields,
                }
            })
            .collect()
    }

    /// Invokes `name` with `params` under a fresh correlation id.
    pub async fn invoke(&self, name: &str, params: Params) -> Outcome {
        self.invoke_request(OperationRequest::new(name, params))
            .await
    }

    /// Runs one request through the pipeline and returns its terminal
    /// outcome. Never waits longer than the operation's clamped budget plus
    /// `dispatch_overhead`.
    pub async fn invoke_request(&self, request: OperationRequest) -> Outcome {
        let requested = request.requested_timeout();
        let (name, params, correlation_id) = request.into_parts();
        let started = Instant::now();
        let budget = self.registry.budget(&name, requested);
        let parameters = summarize_parameters(&params, self.config.context_max_len);

        let context = |elapsed| FaultContext {
            operation: &name,
            correlation_id,
            parameters: parameters.clone(),
            budget: &budget,
            elapsed,
        };

        if !self.is_accepting() {
            let record = classify_refused(&context(Duration::ZERO));
            record.log();
            return Outcome::Error(record);
        }

        let call = OperationCall::new(name.clone(), params, correlation_id)
            .with_requested_timeout(requested);
        let handle = tokio::spawn(self.pipeline.clone().oneshot(call));
        let _abort = AbortOnDrop(handle.abort_handle());
        let bound = budget.duration + self.config.dispatch_overhead;

        let record = match tokio::time::timeout(bound, handle).await {
            Ok(Ok(Ok(value))) => return Outcome::Success(value),
            Ok(Ok(Err(err))) => classify(&err, &context(started.elapsed()), &self.schemas),
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic().as_ref())
                } else {
                    join_err.to_string()
                };
                classify_unexpected(&message, &context(started.elapsed()))
            }
            Err(_) => classify_overrun(&context(started.elapsed())),
        };
        record.log();
        Outcome::Error(record.caller_view(CALLER_VISIBLE_KEYS))
    }

    /// Refuses new invocations. In-flight ones continue to completion.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!(in_flight = self.in_flight_count(), "gateway stopped accepting operations");
        }
    }

    /// Stops accepting and closes the remote session.
    pub async fn shutdown(&self) {
        self.stop_accepting();
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use gateway_core::{ErrorCategory, RemoteCommand, Severity};
    use serde_json::{json, Value};

    use super::*;
    use crate::network::test_helpers::{self, Handler, Reply, ScriptedConnector};
    use crate::network::transport::Connector;

    fn gateway_with(
        config: GatewayConfig,
        connector: ScriptedConnector,
    ) -> (OperationGateway, Arc<ScriptedConnector>) {
        let connector = Arc::new(connector);
        let dyn_connector: Arc<dyn Connector> = connector.clone();
        let connection = Arc::new(ConnectionManager::new(RemoteConfig::default(), dyn_connector));
        let gateway =
            OperationGateway::new(config, catalog::default_registry().unwrap(), connection);
        (gateway, connector)
    }

    fn gateway(handler: Handler) -> (OperationGateway, Arc<ScriptedConnector>) {
        gateway_with(GatewayConfig::default(), ScriptedConnector::new(handler))
    }

    fn silent() -> Handler {
        test_helpers::with_commands(|_| Reply::Silent)
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_returns_remote_result_unchanged() {
        let (gateway, _) = gateway(test_helpers::with_commands(|_: &RemoteCommand| {
            Reply::Value(json!({"scenes": ["Main", "Menu"]}))
        }));
        let outcome = gateway
            .invoke(
                "manage_scene",
                params(json!({"action": "get_hierarchy", "name": "Main", "path": "Assets/Scenes"})),
            )
            .await;
        assert_eq!(outcome, Outcome::Success(json!({"scenes": ["Main", "Menu"]})));
        assert_eq!(gateway.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_remote_times_out_within_budget() {
        let (gateway, _) = gateway(silent());
        let started = Instant::now();
        let outcome = gateway
            .invoke("manage_editor", params(json!({"action": "get_state"})))
            .await;
        let elapsed = started.elapsed();

        let record = outcome.error().unwrap();
        assert_eq!(record.category(), ErrorCategory::Timeout);
        assert_eq!(record.context()["timeout_ms"], 20_000);
        assert_eq!(record.context()["stage"], "awaiting_reply");
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed <= Duration::from_secs(20) + gateway.config().dispatch_overhead);
        assert_eq!(gateway.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_timeout_above_ceiling_is_clamped() {
        let mut config = GatewayConfig::default();
        config.timeouts.ceiling_ms = 600_000;
        config
            .timeouts
            .classes
            .insert("editor_operation".to_string(), 10_000_000);
        let (gateway, _) = gateway_with(config, ScriptedConnector::new(silent()));

        let started = Instant::now();
        let outcome = gateway
            .invoke("manage_editor", params(json!({"action": "get_state"})))
            .await;
        let elapsed = started.elapsed();

        let record = outcome.error().unwrap();
        assert_eq!(record.category(), ErrorCategory::Timeout);
        assert_eq!(record.context()["timeout_ms"], 600_000);
        assert_eq!(record.context()["timeout_clamped"], true);
        assert!(elapsed >= Duration::from_secs(600));
        assert!(elapsed <= Duration::from_secs(600) + gateway.config().dispatch_overhead);
    }

    #[tokio::test(start_paused = true)]
    async fn requested_timeout_is_honoured() {
        let (gateway, _) = gateway(silent());
        let request = OperationRequest::new(
            "manage_scene",
            params(json!({"action": "get_active", "name": "Main", "path": "Assets/Scenes"})),
        )
        .with_requested_timeout(Duration::from_secs(2));
        let started = Instant::now();
        let outcome = gateway.invoke_request(request).await;

        assert_eq!(outcome.error().unwrap().category(), ErrorCategory::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn validation_lists_every_violation_without_connecting() {
        let (gateway, connector) = gateway(test_helpers::responsive());
        let outcome = gateway
            .invoke(
                "manage_scene",
                params(json!({"action": "create", "build_index": 5000})),
            )
            .await;

        let record = outcome.error().unwrap();
        assert_eq!(record.category(), ErrorCategory::Validation);
        assert_eq!(record.severity(), Severity::Low);
        assert_eq!(record.context()["total_violations"], 3);
        let fields: Vec<&str> = record.context()["violations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, vec!["name", "path", "build_index"]);
        assert_eq!(connector.attempts(), 0);
        assert_eq!(gateway.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_operation_is_a_configuration_error() {
        let (gateway, connector) = gateway(test_helpers::responsive());
        let outcome = gateway.invoke("launch_rockets", Params::new()).await;
        assert_eq!(
            outcome.error().unwrap().category(),
            ErrorCategory::Configuration
        );
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_keeps_request_context() {
        let (gateway, _) = gateway(test_helpers::with_commands(|_| {
            Reply::Error("Script 'Player' already exists".to_string())
        }));
        let outcome = gateway
            .invoke(
                "manage_script",
                params(json!({
                    "action": "create",
                    "name": "Player",
                    "path": "Assets/Scripts",
                    "token": "abc"
                })),
            )
            .await;

        let record = outcome.error().unwrap();
        assert_eq!(record.category(), ErrorCategory::RemoteOperation);
        assert_eq!(record.severity(), Severity::Medium);
        assert_eq!(record.context()["operation"], "manage_script");
        assert_eq!(record.context()["parameters"]["name"], "Player");
        assert_eq!(record.context()["parameters"]["token"], "<redacted>");
        assert!(record.context().contains_key("correlation_id"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_remote_reports_attempt_history() {
        let (gateway, connector) = gateway_with(
            GatewayConfig::default(),
            ScriptedConnector::refusing(u32::MAX, test_helpers::responsive()),
        );
        let outcome = gateway
            .invoke("manage_editor", params(json!({"action": "get_state"})))
            .await;

        let record = outcome.error().unwrap();
        assert_eq!(record.category(), ErrorCategory::Connection);
        assert_eq!(record.context()["attempts"].as_array().unwrap().len(), 5);
        assert_eq!(connector.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_invocations_all_complete() {
        let (gateway, _) = gateway(test_helpers::with_commands(|cmd| {
            Reply::After(Duration::from_millis(100), Box::new(Reply::Value(json!(cmd.id))))
        }));
        let gateway = Arc::new(gateway);

        let calls = (0..8).map(|_| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .invoke("read_console", params(json!({"action": "get"})))
                    .await
            })
        });
        for call in calls.collect::<Vec<_>>() {
            assert!(call.await.unwrap().is_success());
        }
        assert_eq!(gateway.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_gateway_refuses_work() {
        let (gateway, connector) = gateway(test_helpers::responsive());
        gateway.stop_accepting();
        let outcome = gateway
            .invoke("read_console", params(json!({"action": "get"})))
            .await;
        assert_eq!(outcome.error().unwrap().category(), ErrorCategory::Connection);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn operations_list_effective_budgets() {
        let (gateway, _) = gateway(test_helpers::responsive());
        let ops = gateway.operations();
        assert_eq!(ops.len(), 8);
        let scene = ops.iter().find(|op| op.name == "manage_scene").unwrap();
        assert_eq!(scene.timeout_class.as_deref(), Some("scene_operation"));
        assert_eq!(scene.timeout_ms, 60_000);
        assert!(scene.fields.contains(&"build_index".to_string()));
    }
}
