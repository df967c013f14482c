//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use gpupool_core::{
    AllocationHandle, AllocationId, AllocationRequest, ClusterMetrics, DeviceId, DeviceView,
    PoolError, Reservation, ResourceShare, ResourceStatus,
};
use gpupool_monitor::{Monitor, MonitorEvent, MonitorState};
use gpupool_scheduler::Cluster;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub monitor: Arc<Monitor>,
}

/// Create the API router
pub fn create_router(cluster: Arc<Cluster>, monitor: Arc<Monitor>) -> Router {
    let state = Arc::new(AppState { cluster, monitor });

    Router::new()
        .route(
            "/api/v1/allocations",
            post(create_allocation).get(list_allocations),
        )
        .route(
            "/api/v1/allocations/:id",
            get(get_allocation).delete(release_allocation),
        )
        .route("/api/v1/allocations/:id/migrate", post(migrate_allocation))
        .route("/api/v1/plan", post(plan_allocation))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:id", get(get_device))
        .route("/api/v1/cluster/expand", post(expand_cluster))
        .route("/api/v1/cluster/shrink", post(shrink_cluster))
        .route("/api/v1/metrics", get(get_metrics))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/health", get(get_health))
        .route("/api/v1/events", get(stream_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body returned with every non-2xx response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error kind
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn status_for(err: &PoolError) -> StatusCode {
    match err {
        PoolError::AllocationNotFound(_) | PoolError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        PoolError::InsufficientCapacity { .. }
        | PoolError::CapacityExceeded { .. }
        | PoolError::DeviceNotEmpty { .. }
        | PoolError::WouldRemoveActiveReservations { .. }
        | PoolError::InsufficientDevices { .. }
        | PoolError::ClusterSizeLimit { .. } => StatusCode::CONFLICT,
        PoolError::InvalidRequest(_) | PoolError::RequestExceedsDeviceCapacity { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PoolError::Confirmation { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: PoolError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, kind = err.kind(), "Request failed");
    }
    (
        status,
        Json(ErrorBody {
            error: err.kind().to_string(),
            message: err.to_string(),
        }),
    )
}

/// Allocate devices for a request
async fn create_allocation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AllocationRequest>,
) -> Result<(StatusCode, Json<AllocationHandle>), ApiError> {
    info!(
        owner = %req.owner,
        devices = req.device_count,
        priority = %req.priority,
        "Allocation requested"
    );

    let handle = state.cluster.allocate(req).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(handle)))
}

/// List active allocations
async fn list_allocations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Reservation>>, ApiError> {
    Ok(Json(state.cluster.list_active_allocations().await))
}

/// Get a live or recently finished allocation
async fn get_allocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AllocationId>,
) -> Result<Json<Reservation>, ApiError> {
    state
        .cluster
        .get_allocation(id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(PoolError::AllocationNotFound(id)))
}

/// Release an allocation
async fn release_allocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AllocationId>,
) -> Result<StatusCode, ApiError> {
    info!(allocation_id = %id, "Releasing allocation");
    state.cluster.release(id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request to migrate an allocation
#[derive(Debug, Default, Deserialize)]
pub struct MigrateRequest {
    /// Devices the allocation must not land on
    #[serde(default)]
    pub exclude: Vec<DeviceId>,
}

/// Move an allocation to other devices
async fn migrate_allocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AllocationId>,
    Json(req): Json<MigrateRequest>,
) -> Result<Json<AllocationHandle>, ApiError> {
    info!(allocation_id = %id, exclude = ?req.exclude, "Migrating allocation");

    let device_ids = state
        .cluster
        .migrate(id, &req.exclude)
        .await
        .map_err(api_error)?;

    Ok(Json(AllocationHandle {
        allocation_id: id,
        device_ids,
    }))
}

/// Dry-run placement result
#[derive(Debug, Serialize, Deserialize)]
pub struct PlanResponse {
    pub device_ids: Vec<DeviceId>,
    /// Share each selected device would commit
    pub per_device: ResourceShare,
}

/// Plan a request without reserving anything
async fn plan_allocation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AllocationRequest>,
) -> Result<Json<PlanResponse>, ApiError> {
    let placement = req.placement().map_err(api_error)?;
    let device_ids = state.cluster.plan(&placement).await.map_err(api_error)?;

    Ok(Json(PlanResponse {
        device_ids,
        per_device: placement.per_device,
    }))
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceView>> {
    Json(state.cluster.list_devices().await)
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DeviceId>,
) -> Result<Json<DeviceView>, ApiError> {
    state
        .cluster
        .get_device(id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(PoolError::DeviceNotFound(id)))
}

/// Request to grow or shrink the cluster
#[derive(Debug, Deserialize)]
pub struct TopologyRequest {
    pub count: usize,
}

/// Devices added or removed by a topology change
#[derive(Debug, Serialize, Deserialize)]
pub struct TopologyResponse {
    pub device_ids: Vec<DeviceId>,
    /// Cluster size after the change
    pub device_count: usize,
}

async fn expand_cluster(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TopologyRequest>,
) -> Result<Json<TopologyResponse>, ApiError> {
    let device_ids = state.cluster.expand(req.count).await.map_err(api_error)?;
    Ok(Json(TopologyResponse {
        device_ids,
        device_count: state.cluster.device_count().await,
    }))
}

async fn shrink_cluster(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TopologyRequest>,
) -> Result<Json<TopologyResponse>, ApiError> {
    let device_ids = state.cluster.shrink(req.count).await.map_err(api_error)?;
    Ok(Json(TopologyResponse {
        device_ids,
        device_count: state.cluster.device_count().await,
    }))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<ClusterMetrics> {
    Json(state.cluster.cluster_metrics().await)
}

/// System status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub resources: ResourceStatus,
    pub active_allocations: usize,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        resources: state.cluster.resource_status().await,
        active_allocations: state.cluster.list_active_allocations().await.len(),
    })
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub monitor: MonitorState,
    /// Metrics from the monitor's most recent tick
    pub latest_metrics: Option<ClusterMetrics>,
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        monitor: state.monitor.state().await,
        latest_metrics: state.monitor.latest_metrics(),
    })
}

/// Stream monitor events as they are published
///
/// Each event is named by its kind and carries the event as JSON. A client
/// that falls behind skips the events it missed. The stream ends after the
/// monitor stops.
async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("Event stream client connected");

    let events = stream::unfold(Some(state.monitor.subscribe()), |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let last = matches!(event, MonitorEvent::Stopped | MonitorEvent::Fatal { .. });
                    match Event::default().event(event.kind()).json_data(&event) {
                        Ok(sse) => return Some((Ok(sse), (!last).then_some(rx))),
                        Err(e) => warn!(error = %e, kind = event.kind(), "Failed to encode event"),
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event stream client lagged, skipped events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use futures::StreamExt;
    use gpupool_core::{AllocationStatus, HealthThresholds, MetricsSnapshot, MonitorConfig};
    use gpupool_monitor::StaticTelemetryProvider;
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(devices: usize) -> (Router, Arc<Monitor>) {
        let cluster = Arc::new(Cluster::builder().devices(devices).build().unwrap());
        let provider = StaticTelemetryProvider::with_fallback(MetricsSnapshot::idle(100));
        let monitor = Arc::new(Monitor::new(
            Arc::clone(&cluster),
            Arc::new(provider),
            MonitorConfig::default(),
            HealthThresholds::default(),
        ));
        (create_router(cluster, Arc::clone(&monitor)), monitor)
    }

    fn router(devices: usize) -> Router {
        app(devices).0
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allocate_get_release() {
        let router = router(4);
        let (status, body) = send(
            &router,
            Method::POST,
            "/api/v1/allocations",
            Some(json!({ "owner": "llm", "device_count": 2, "memory_bytes": 1000 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let handle: AllocationHandle = parse(&body);
        assert_eq!(handle.device_ids, vec![0, 1]);

        let uri = format!("/api/v1/allocations/{}", handle.allocation_id);
        let (status, body) = send(&router, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse::<Reservation>(&body).status, AllocationStatus::Active);

        let (status, _) = send(&router, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&router, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(parse::<ErrorBody>(&body).error, "allocation_not_found");
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let router = router(2);

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/v1/allocations",
            Some(json!({ "owner": "llm", "device_count": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(parse::<ErrorBody>(&body).error, "insufficient_capacity");

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/v1/plan",
            Some(json!({ "owner": "llm", "device_count": 1, "power_watts": 5000 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            parse::<ErrorBody>(&body).error,
            "request_exceeds_device_capacity"
        );

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/v1/plan",
            Some(json!({ "owner": "llm", "device_count": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(&router, Method::GET, "/api/v1/devices/9", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_plan_does_not_reserve() {
        let router = router(3);
        let (status, body) = send(
            &router,
            Method::POST,
            "/api/v1/plan",
            Some(json!({
                "owner": "analytics",
                "device_count": 2,
                "memory_bytes": 100,
                "accounting": "total"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let plan: PlanResponse = parse(&body);
        assert_eq!(plan.device_ids, vec![0, 1]);
        assert_eq!(plan.per_device.memory_bytes, 50);

        let (_, body) = send(&router, Method::GET, "/api/v1/status", None).await;
        let status: StatusResponse = parse(&body);
        assert_eq!(status.active_allocations, 0);
        assert_eq!(status.resources.devices.idle, 3);
    }

    #[tokio::test]
    async fn test_topology_and_migrate() {
        let router = router(2);

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/v1/cluster/expand",
            Some(json!({ "count": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let expanded: TopologyResponse = parse(&body);
        assert_eq!(expanded.device_ids, vec![2, 3]);
        assert_eq!(expanded.device_count, 4);

        let (_, body) = send(
            &router,
            Method::POST,
            "/api/v1/allocations",
            Some(json!({ "owner": "tts", "device_count": 1 })),
        )
        .await;
        let handle: AllocationHandle = parse(&body);

        let (status, body) = send(
            &router,
            Method::POST,
            &format!("/api/v1/allocations/{}/migrate", handle.allocation_id),
            Some(json!({ "exclude": [1, 2] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse::<AllocationHandle>(&body).device_ids, vec![3]);

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/v1/cluster/shrink",
            Some(json!({ "count": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(
            parse::<ErrorBody>(&body).error,
            "would_remove_active_reservations"
        );
    }

    #[tokio::test]
    async fn test_devices_and_metrics() {
        let router = router(2);

        let (status, body) = send(&router, Method::GET, "/api/v1/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse::<Vec<DeviceView>>(&body).len(), 2);

        let (status, body) = send(&router, Method::GET, "/api/v1/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let metrics: ClusterMetrics = parse(&body);
        assert_eq!(metrics.device_count, 2);
        assert_eq!(metrics.reporting_devices, 0);
    }

    #[tokio::test]
    async fn test_health_reports_monitor() {
        let (router, monitor) = app(2);

        let (status, body) = send(&router, Method::GET, "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = parse(&body);
        assert_eq!(health.status, "ok");
        assert_eq!(health.monitor, MonitorState::Stopped);
        assert!(health.latest_metrics.is_none());

        monitor.tick_once().await.unwrap();
        let (_, body) = send(&router, Method::GET, "/api/v1/health", None).await;
        let health: HealthResponse = parse(&body);
        assert_eq!(health.latest_metrics.unwrap().reporting_devices, 2);
    }

    #[tokio::test]
    async fn test_events_stream() {
        let (router, monitor) = app(1);

        let request = Request::builder()
            .uri("/api/v1/events")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/event-stream"));

        monitor.tick_once().await.unwrap();

        let mut body = response.into_body().into_data_stream();
        let mut text = String::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !text.contains("event: metrics") {
                let chunk = body.next().await.unwrap().unwrap();
                text.push_str(std::str::from_utf8(&chunk).unwrap());
            }
        })
        .await
        .unwrap();

        assert!(text.contains("event: telemetry"));
        assert!(text.contains(r#""type":"metrics""#));

        monitor.start().await;
        monitor.stop().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = body.next().await {
                text.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
            }
        })
        .await
        .unwrap();
        assert!(text.contains("event: stopped"));
        assert!(text.ends_with("{\"type\":\"stopped\"}\n\n"));
    }
}
