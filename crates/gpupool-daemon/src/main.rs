//! gpupool daemon
//!
//! Owns the cluster handle, runs the monitoring loop and serves the REST API.

use anyhow::Context;
use clap::Parser;
use gpupool_api::create_router;
use gpupool_core::{EngineConfig, LoggingConfig};
use gpupool_monitor::{
    HttpTelemetryProvider, Monitor, MonitorEvent, NullTelemetryProvider, TelemetryProvider,
};
use gpupool_scheduler::Cluster;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// gpupool daemon - capacity accounting and placement for a GPU pool
#[derive(Parser, Debug)]
#[command(name = "gpupoold")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Number of devices registered at startup
    #[arg(long)]
    devices: Option<usize>,

    /// Base URL of the telemetry service
    #[arg(long)]
    telemetry_endpoint: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => EngineConfig::default(),
        };

        if let Some(address) = &self.address {
            config.api.address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(devices) = self.devices {
            config.pool.initial_devices = devices;
        }
        if let Some(endpoint) = &self.telemetry_endpoint {
            config.telemetry.endpoint = Some(endpoint.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if logging.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install subscriber: {}", e))
}

fn telemetry_provider(config: &EngineConfig) -> anyhow::Result<Arc<dyn TelemetryProvider>> {
    match &config.telemetry.endpoint {
        Some(endpoint) => {
            let provider = HttpTelemetryProvider::new(
                endpoint,
                Duration::from_millis(config.monitor.telemetry_timeout_ms),
            )?;
            info!(endpoint = %endpoint, "Using HTTP telemetry");
            Ok(Arc::new(provider))
        }
        None => {
            warn!("No telemetry endpoint configured; devices will not report metrics");
            Ok(Arc::new(NullTelemetryProvider))
        }
    }
}

/// Log monitor events until the channel closes
async fn log_events(mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(MonitorEvent::Metrics(metrics)) => debug!(
                devices = metrics.device_count,
                reporting = metrics.reporting_devices,
                active = metrics.active_reservations,
                "Cluster metrics"
            ),
            Ok(MonitorEvent::Fatal { reason }) => {
                error!(reason = %reason, "Monitoring halted");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event logger lagging");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_logging(&config.logging)?;

    info!("Starting gpupool daemon v{}", env!("CARGO_PKG_VERSION"));

    let cluster = Arc::new(Cluster::from_config(&config)?);

    let monitor = Arc::new(Monitor::new(
        Arc::clone(&cluster),
        telemetry_provider(&config)?,
        config.monitor.clone(),
        config.health.clone(),
    ));
    tokio::spawn(log_events(monitor.subscribe()));
    monitor.start().await;

    let router = create_router(Arc::clone(&cluster), Arc::clone(&monitor));

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    info!(address = %addr, devices = config.pool.initial_devices, "API server listening");

    // Stopping the monitor ends open event streams so shutdown can drain
    let stopping = Arc::clone(&monitor);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stopping.stop().await;
        })
        .await
        .context("API server error")?;

    monitor.stop().await;
    info!("gpupool daemon stopped");
    Ok(())
}
