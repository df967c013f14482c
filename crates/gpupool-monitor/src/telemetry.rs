//! Telemetry providers: where per-device metrics come from

use async_trait::async_trait;
use gpupool_core::{DeviceId, MetricsSnapshot, TelemetryError};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Source of per-device metrics snapshots
///
/// Callers bound every call with their own timeout; implementations should
/// still avoid unbounded blocking.
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Fetch the current metrics for a device
    async fn get_metrics(&self, device_id: DeviceId) -> Result<MetricsSnapshot, TelemetryError>;

    /// Get the provider name
    fn name(&self) -> &'static str;
}

/// Reports every device as unavailable; used when no telemetry source is
/// configured
pub struct NullTelemetryProvider;

#[async_trait]
impl TelemetryProvider for NullTelemetryProvider {
    async fn get_metrics(&self, _device_id: DeviceId) -> Result<MetricsSnapshot, TelemetryError> {
        Err(TelemetryError::Unavailable(
            "no telemetry source configured".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

#[derive(Debug, Clone)]
enum Fixture {
    Report(MetricsSnapshot),
    Fail(TelemetryError),
    Hang,
}

/// Deterministic fixture data, settable per device
///
/// Devices without a fixture get the fallback snapshot, or an
/// `Unavailable` error when no fallback is set.
#[derive(Default)]
pub struct StaticTelemetryProvider {
    fixtures: RwLock<HashMap<DeviceId, Fixture>>,
    fallback: Option<MetricsSnapshot>,
}

impl StaticTelemetryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `snapshot` for every device without its own fixture
    pub fn with_fallback(snapshot: MetricsSnapshot) -> Self {
        Self {
            fixtures: RwLock::new(HashMap::new()),
            fallback: Some(snapshot),
        }
    }

    fn set(&self, device_id: DeviceId, fixture: Fixture) {
        self.fixtures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id, fixture);
    }

    pub fn report(&self, device_id: DeviceId, snapshot: MetricsSnapshot) {
        self.set(device_id, Fixture::Report(snapshot));
    }

    pub fn fail(&self, device_id: DeviceId, error: TelemetryError) {
        self.set(device_id, Fixture::Fail(error));
    }

    /// Make calls for this device never complete
    pub fn hang(&self, device_id: DeviceId) {
        self.set(device_id, Fixture::Hang);
    }

    pub fn clear(&self, device_id: DeviceId) {
        self.fixtures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device_id);
    }
}

#[async_trait]
impl TelemetryProvider for StaticTelemetryProvider {
    async fn get_metrics(&self, device_id: DeviceId) -> Result<MetricsSnapshot, TelemetryError> {
        let fixture = self
            .fixtures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id)
            .cloned();

        match fixture {
            Some(Fixture::Report(snapshot)) => Ok(snapshot),
            Some(Fixture::Fail(err)) => Err(err),
            Some(Fixture::Hang) => std::future::pending().await,
            None => self.fallback.clone().ok_or_else(|| {
                TelemetryError::Unavailable(format!("no fixture for device {}", device_id))
            }),
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Fetches `GET {endpoint}/devices/{id}/metrics` as JSON
pub struct HttpTelemetryProvider {
    /// HTTP client for metrics requests
    client: reqwest::Client,
    /// Base URL of the metrics service
    endpoint: String,
    /// Timeout duration
    timeout: Duration,
}

impl HttpTelemetryProvider {
    /// Create a new provider with a client-level request timeout
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn url(&self, device_id: DeviceId) -> String {
        format!("{}/devices/{}/metrics", self.endpoint, device_id)
    }

    /// Get the timeout duration
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl TelemetryProvider for HttpTelemetryProvider {
    async fn get_metrics(&self, device_id: DeviceId) -> Result<MetricsSnapshot, TelemetryError> {
        let url = self.url(device_id);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                TelemetryError::Timeout(self.timeout.as_millis() as u64)
            } else {
                TelemetryError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TelemetryError::Unavailable(format!(
                "device {} unknown to metrics service",
                device_id
            )));
        }
        if !status.is_success() {
            return Err(TelemetryError::Transport(format!(
                "{} returned {}",
                url, status
            )));
        }

        let snapshot = response
            .json::<MetricsSnapshot>()
            .await
            .map_err(|e| TelemetryError::Malformed(e.to_string()))?;

        debug!(device_id, endpoint = %url, "Fetched device metrics");
        Ok(snapshot)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};

    #[tokio::test]
    async fn test_static_provider_fixtures() {
        let provider = StaticTelemetryProvider::with_fallback(MetricsSnapshot::idle(100));
        let mut hot = MetricsSnapshot::idle(100);
        hot.temperature_c = 90.0;
        provider.report(1, hot.clone());
        provider.fail(2, TelemetryError::Transport("reset".to_string()));

        assert_eq!(provider.get_metrics(0).await.unwrap(), MetricsSnapshot::idle(100));
        assert_eq!(provider.get_metrics(1).await.unwrap(), hot);
        assert!(matches!(
            provider.get_metrics(2).await,
            Err(TelemetryError::Transport(_))
        ));

        provider.clear(1);
        assert_eq!(provider.get_metrics(1).await.unwrap(), MetricsSnapshot::idle(100));
    }

    #[tokio::test]
    async fn test_static_provider_without_fallback() {
        let provider = StaticTelemetryProvider::new();
        assert!(matches!(
            provider.get_metrics(0).await,
            Err(TelemetryError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_null_provider() {
        assert!(NullTelemetryProvider.get_metrics(3).await.is_err());
    }

    #[test]
    fn test_http_provider_url() {
        let provider =
            HttpTelemetryProvider::new("http://metrics:8000/", Duration::from_millis(300)).unwrap();
        assert_eq!(provider.url(3), "http://metrics:8000/devices/3/metrics");
        assert_eq!(provider.timeout(), Duration::from_millis(300));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_provider_fetches_and_maps_errors() {
        let router = Router::new().route(
            "/devices/:id/metrics",
            get(|Path(id): Path<u32>| async move {
                match id {
                    0 => {
                        let mut snap = MetricsSnapshot::idle(183);
                        snap.utilization_pct = 42.0;
                        Ok(Json(snap))
                    }
                    1 => Err(StatusCode::NOT_FOUND),
                    _ => Err(StatusCode::INTERNAL_SERVER_ERROR),
                }
            }),
        );
        let base = serve(router).await;
        let provider = HttpTelemetryProvider::new(&base, Duration::from_secs(2)).unwrap();

        assert_eq!(provider.get_metrics(0).await.unwrap().utilization_pct, 42.0);
        assert!(matches!(
            provider.get_metrics(1).await,
            Err(TelemetryError::Unavailable(_))
        ));
        assert!(matches!(
            provider.get_metrics(2).await,
            Err(TelemetryError::Transport(_))
        ));
    }
}
