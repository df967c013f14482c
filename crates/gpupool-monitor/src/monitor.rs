//! Periodic telemetry refresh and cluster metrics publication

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use gpupool_core::{
    ClusterMetrics, DeviceId, HealthThresholds, MetricsSnapshot, MonitorConfig, PoolResult,
    TelemetryError, TelemetryReading,
};
use gpupool_scheduler::Cluster;
use serde::{Deserialize, Serialize, Serializer};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::health::{self, HealthAlert};
use crate::telemetry::TelemetryProvider;

/// Consistency check run after every tick when `monitor.audit` is set
///
/// An error is fatal to the loop.
#[async_trait]
pub trait Auditor: Send + Sync {
    async fn audit(&self) -> PoolResult<()>;
}

#[async_trait]
impl Auditor for Cluster {
    async fn audit(&self) -> PoolResult<()> {
        Cluster::audit(self).await
    }
}

/// Whether the periodic loop is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Running,
}

/// Everything the monitor publishes, in publish order within a tick
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A device reported fresh metrics
    Telemetry {
        device_id: DeviceId,
        reading: TelemetryReading,
    },
    /// A device did not report; its previous reading (if any) is kept
    TelemetryFailed {
        device_id: DeviceId,
        #[serde(serialize_with = "display")]
        error: TelemetryError,
        last_seen: Option<DateTime<Utc>>,
    },
    Alert(HealthAlert),
    /// Published once per tick after every device was refreshed
    Metrics(ClusterMetrics),
    Stopped,
    /// The loop found an internal invariant broken and stopped itself
    Fatal { reason: String },
}

impl MonitorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::Telemetry { .. } => "telemetry",
            MonitorEvent::TelemetryFailed { .. } => "telemetry_failed",
            MonitorEvent::Alert(_) => "alert",
            MonitorEvent::Metrics(_) => "metrics",
            MonitorEvent::Stopped => "stopped",
            MonitorEvent::Fatal { .. } => "fatal",
        }
    }
}

fn display<S: Serializer>(error: &TelemetryError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

struct MonitorInner {
    cluster: Arc<Cluster>,
    provider: Arc<dyn TelemetryProvider>,
    auditor: Arc<dyn Auditor>,
    config: MonitorConfig,
    thresholds: HealthThresholds,
    events: broadcast::Sender<MonitorEvent>,
    latest: RwLock<Option<ClusterMetrics>>,
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Monitoring loop over one cluster
pub struct Monitor {
    inner: Arc<MonitorInner>,
    running: Mutex<Option<RunningLoop>>,
}

impl Monitor {
    /// Monitor that audits the cluster's own ledger
    pub fn new(
        cluster: Arc<Cluster>,
        provider: Arc<dyn TelemetryProvider>,
        config: MonitorConfig,
        thresholds: HealthThresholds,
    ) -> Self {
        let auditor: Arc<dyn Auditor> = cluster.clone();
        Self::with_auditor(cluster, provider, auditor, config, thresholds)
    }

    pub fn with_auditor(
        cluster: Arc<Cluster>,
        provider: Arc<dyn TelemetryProvider>,
        auditor: Arc<dyn Auditor>,
        mut config: MonitorConfig,
        thresholds: HealthThresholds,
    ) -> Self {
        if config.interval_ms == 0 {
            warn!("monitor.interval_ms is 0, using 1 ms");
            config.interval_ms = 1;
        }

        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(MonitorInner {
                cluster,
                provider,
                auditor,
                config,
                thresholds,
                events,
                latest: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Receive every event published from now on
    ///
    /// Slow receivers lag and skip the oldest events rather than blocking
    /// the loop.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> MonitorState {
        match self.running.lock().await.as_ref() {
            Some(running) if !running.handle.is_finished() => MonitorState::Running,
            _ => MonitorState::Stopped,
        }
    }

    /// Start the periodic loop; no-op while already running
    ///
    /// The first tick runs immediately.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                debug!("Monitor already running");
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(Arc::clone(&self.inner), stop_rx));
        *running = Some(RunningLoop { stop_tx, handle });

        info!(
            interval_ms = self.inner.config.interval_ms,
            provider = self.inner.provider.name(),
            "Monitor started"
        );
    }

    /// Stop the loop and wait for it to exit; no-op while stopped
    ///
    /// An in-flight tick finishes first; no further tick begins.
    pub async fn stop(&self) {
        let Some(current) = self.running.lock().await.take() else {
            return;
        };

        let _ = current.stop_tx.send(true);
        if let Err(e) = current.handle.await {
            error!(error = %e, "Monitor task ended abnormally");
        }

        self.inner.publish(MonitorEvent::Stopped);
        info!("Monitor stopped");
    }

    /// Run one refresh immediately, independent of the periodic loop
    pub async fn tick_once(&self) -> PoolResult<ClusterMetrics> {
        self.inner.tick().await
    }

    /// Metrics from the most recent completed tick
    pub fn latest_metrics(&self) -> Option<ClusterMetrics> {
        self.inner
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn run(inner: Arc<MonitorInner>, mut stop_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(inner.config.interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = interval.tick() => {}
        }

        if *stop_rx.borrow() {
            break;
        }

        if let Err(err) = inner.tick().await {
            error!(error = %err, "Monitor stopping on fatal error");
            inner.publish(MonitorEvent::Fatal {
                reason: err.to_string(),
            });
            break;
        }
    }
}

impl MonitorInner {
    fn publish(&self, event: MonitorEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    async fn fetch(
        &self,
        device_id: DeviceId,
    ) -> (DeviceId, Result<MetricsSnapshot, TelemetryError>) {
        let timeout_ms = self.config.telemetry_timeout_ms;
        let outcome = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.provider.get_metrics(device_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::Timeout(timeout_ms)),
        };
        (device_id, outcome)
    }

    async fn tick(&self) -> PoolResult<ClusterMetrics> {
        let device_ids = self.cluster.device_ids().await;
        let results = join_all(device_ids.iter().map(|&id| self.fetch(id))).await;

        let board = self.cluster.telemetry();
        let captured_at = Utc::now();

        for (device_id, outcome) in results {
            match outcome {
                Ok(metrics) => {
                    let reading = TelemetryReading::new(metrics, captured_at);
                    // Removed mid-tick.
                    if !board.update(device_id, reading.clone()) {
                        continue;
                    }
                    debug!(
                        device_id,
                        utilization_pct = reading.metrics.utilization_pct,
                        temperature_c = reading.metrics.temperature_c,
                        "Device telemetry refreshed"
                    );

                    let alerts = health::evaluate(device_id, &reading.metrics, &self.thresholds);
                    self.publish(MonitorEvent::Telemetry { device_id, reading });
                    for alert in alerts {
                        warn!(
                            device_id,
                            level = %alert.level,
                            kind = %alert.kind,
                            value = alert.value,
                            threshold = alert.threshold,
                            "Device health alert"
                        );
                        self.publish(MonitorEvent::Alert(alert));
                    }
                }
                Err(error) => {
                    let last_seen = board.latest(device_id).map(|r| r.captured_at);
                    warn!(device_id, error = %error, "Telemetry refresh failed");
                    self.publish(MonitorEvent::TelemetryFailed {
                        device_id,
                        error,
                        last_seen,
                    });
                }
            }
        }

        if self.config.audit {
            self.auditor.audit().await?;
        }

        let metrics = self.cluster.cluster_metrics().await;
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());
        self.publish(MonitorEvent::Metrics(metrics.clone()));

        debug!(
            devices = metrics.device_count,
            reporting = metrics.reporting_devices,
            "Cluster metrics published"
        );

        Ok(metrics)
    }
}
