//! `editor-gateway`: serves the operation gateway over HTTP and forwards
//! invocations to a running editor process.
//!
//! ```bash
//! editor-gateway --port 8080 --remote-host localhost --remote-port 6400
//! editor-gateway --timeouts-file timeouts.json --metrics-port 9100 --log-json
//! editor-gateway --retry-max-attempts 3 --probe-interval-secs 10
//! ```
//!
//! Tuning flags left unset keep the built-in defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gateway_core::ErrorRecord;
use gateway_server::network::{ConfigError, HttpConfig, NetworkModule, RemoteConfig};
use gateway_server::service::{
    load_timeout_table, BackgroundWorker, GatewayConfig, OperationGateway, ProbeRunnable,
    SweepRunnable,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "editor-gateway",
    about = "Bounded-latency operation gateway in front of a remote editor process",
    version
)]
struct Cli {
    /// Address the HTTP surface binds to.
    #[arg(long, env = "GATEWAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// HTTP port; 0 picks a free port.
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8080)]
    port: u16,

    /// Host of the editor process.
    #[arg(long, env = "EDITOR_HOST", default_value = "localhost")]
    remote_host: String,

    /// Port of the editor process.
    #[arg(long, env = "EDITOR_PORT", default_value_t = 6400)]
    remote_port: u16,

    /// JSON file with timeout overrides merged over the built-in table.
    #[arg(long, env = "GATEWAY_TIMEOUTS_FILE", value_name = "FILE")]
    timeouts_file: Option<PathBuf>,

    /// Full parameter validation; `false` checks only that the operation exists.
    #[arg(
        long,
        env = "GATEWAY_STRICT_VALIDATION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    strict_validation: bool,

    /// Seconds shutdown waits for in-flight operations.
    #[arg(long, env = "GATEWAY_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    drain_timeout_secs: u64,

    /// Slack added to an operation's budget for the outer bound on a call.
    #[arg(long, env = "GATEWAY_DISPATCH_OVERHEAD_MS")]
    dispatch_overhead_ms: Option<u64>,

    /// Bound on one connect attempt, including its verification ping.
    #[arg(long, env = "EDITOR_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Connect attempts per call before giving up.
    #[arg(long, env = "EDITOR_RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<u32>,

    /// Backoff before the first retry; doubles per attempt.
    #[arg(long, env = "EDITOR_RETRY_BASE_DELAY_MS")]
    retry_base_delay_ms: Option<u64>,

    /// Upper bound on the backoff between attempts.
    #[arg(long, env = "EDITOR_RETRY_MAX_DELAY_MS")]
    retry_max_delay_ms: Option<u64>,

    /// Interval of the background liveness probe.
    #[arg(long, env = "EDITOR_PROBE_INTERVAL_SECS")]
    probe_interval_secs: Option<u64>,

    /// Bound on one probe round trip.
    #[arg(long, env = "EDITOR_PROBE_TIMEOUT_MS")]
    probe_timeout_ms: Option<u64>,

    /// Consecutive failed probes after which the session is closed.
    #[arg(long, env = "EDITOR_PROBE_FAILURE_THRESHOLD")]
    probe_failure_threshold: Option<u32>,

    /// Probe an idle session before reusing it after this many seconds.
    #[arg(long, env = "EDITOR_IDLE_PROBE_AFTER_SECS")]
    idle_probe_after_secs: Option<u64>,

    /// Expose Prometheus metrics on this port.
    #[arg(long, env = "GATEWAY_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "GATEWAY_LOG_JSON")]
    log_json: bool,
}

struct Configs {
    gateway: GatewayConfig,
    remote: RemoteConfig,
    http: HttpConfig,
}

fn build_configs(cli: &Cli) -> Result<Configs, ConfigError> {
    let mut gateway = GatewayConfig {
        strict_validation: cli.strict_validation,
        ..GatewayConfig::default()
    };
    if let Some(path) = &cli.timeouts_file {
        gateway.timeouts = load_timeout_table(path)?;
    }
    if let Some(ms) = cli.dispatch_overhead_ms {
        gateway.dispatch_overhead = Duration::from_millis(ms);
    }
    gateway.validate()?;

    let mut remote = RemoteConfig {
        host: cli.remote_host.clone(),
        port: cli.remote_port,
        ..RemoteConfig::default()
    };
    if let Some(ms) = cli.connect_timeout_ms {
        remote.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = cli.retry_max_attempts {
        remote.retry.max_attempts = n;
    }
    if let Some(ms) = cli.retry_base_delay_ms {
        remote.retry.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.retry_max_delay_ms {
        remote.retry.max_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = cli.probe_interval_secs {
        remote.probe_interval = Duration::from_secs(secs);
    }
    if let Some(ms) = cli.probe_timeout_ms {
        remote.probe_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = cli.probe_failure_threshold {
        remote.probe_failure_threshold = n;
    }
    if let Some(secs) = cli.idle_probe_after_secs {
        remote.idle_probe_after = Duration::from_secs(secs);
    }
    remote.validate()?;

    let http = HttpConfig {
        host: cli.host.clone(),
        port: cli.port,
        drain_timeout: Duration::from_secs(cli.drain_timeout_secs),
        ..HttpConfig::default()
    };
    http.validate()?;
    Ok(Configs {
        gateway,
        remote,
        http,
    })
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to parse log filter")?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
    } else {
        registry
            .with(fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
    }
}

fn install_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(port) = cli.metrics_port {
        install_metrics(port)?;
    }

    let configs = build_configs(&cli).map_err(|err| {
        ErrorRecord::from(&err).log();
        anyhow::Error::new(err)
    })?;
    let gateway = OperationGateway::from_config(configs.gateway, configs.remote).map_err(|err| {
        ErrorRecord::from(&err).log();
        anyhow::Error::new(err)
    })?;
    let gateway = Arc::new(gateway);
    info!(
        endpoint = %gateway.connection().endpoint(),
        operations = gateway.operations().len(),
        strict_validation = gateway.config().strict_validation,
        "gateway configured"
    );

    let mut sweeper = BackgroundWorker::start(
        SweepRunnable::new(Arc::clone(gateway.registry())),
        gateway.config().sweep_interval,
    );
    let mut prober = BackgroundWorker::start(
        ProbeRunnable::new(Arc::clone(gateway.connection())),
        gateway.connection().config().probe_interval,
    );

    let mut network = NetworkModule::new(configs.http, Arc::clone(&gateway));
    let port = network.start().await?;
    info!(port, "editor gateway ready");

    let served = network.serve(shutdown_signal()).await;

    prober.stop().await;
    sweeper.stop().await;
    gateway.shutdown().await;
    info!("editor gateway stopped");
    served
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_json) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "editor gateway failed");
            ExitCode::FAILURE
        }
    }
}
