//! Cluster handle: the explicit, constructed owner of all engine state

use chrono::Utc;
use gpupool_core::{
    AllocationConfig, AllocationHandle, AllocationId, AllocationRequest, ClusterMetrics,
    DeviceCapacity, DeviceCounts, DeviceId, DeviceView, EngineConfig, PlacementPolicy,
    PlacementRequest, PoolError, PoolResult, Reservation, ResourceShare, ResourceStatus, TelemetryReading,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::dispatch::{ImmediateDispatcher, WorkloadDispatcher};
use crate::ledger::{AllocationLedger, ReservationTerms};
use crate::placement::{LeastLoadedFirst, LowestIndexFirst, PlacementStrategy, Planner};
use crate::registry::{DeviceRegistry, TelemetryBoard};

/// Device table and ledger, guarded together by one lock so capacity checks
/// and commits never interleave
pub struct Inventory {
    pub registry: DeviceRegistry,
    pub ledger: AllocationLedger,
}

/// Shared handle to one GPU pool
pub struct Cluster {
    pub(crate) inventory: RwLock<Inventory>,
    /// Same board the registry writes through; held here so telemetry access
    /// never touches the inventory lock
    telemetry: Arc<TelemetryBoard>,
    pub(crate) planner: Planner,
    dispatcher: Arc<dyn WorkloadDispatcher>,
    pub(crate) standard_capacity: DeviceCapacity,
    allocation: AllocationConfig,
    staleness: chrono::Duration,
}

/// Builder for [`Cluster`]
pub struct ClusterBuilder {
    initial_devices: usize,
    capacity: DeviceCapacity,
    max_devices: Option<usize>,
    history_limit: usize,
    strategy: Arc<dyn PlacementStrategy>,
    dispatcher: Arc<dyn WorkloadDispatcher>,
    allocation: AllocationConfig,
    staleness: chrono::Duration,
}

impl ClusterBuilder {
    /// Number of devices registered at build time
    pub fn devices(mut self, count: usize) -> Self {
        self.initial_devices = count;
        self
    }

    /// Standard capacity for initial and expanded devices
    pub fn capacity(mut self, capacity: DeviceCapacity) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn max_devices(mut self, max: Option<usize>) -> Self {
        self.max_devices = max;
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn PlacementStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn WorkloadDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn allocation(mut self, allocation: AllocationConfig) -> Self {
        self.allocation = allocation;
        self
    }

    /// Age after which telemetry stops counting as reporting
    pub fn staleness(mut self, staleness: Duration) -> Self {
        self.staleness =
            chrono::Duration::from_std(staleness).unwrap_or_else(|_| chrono::Duration::weeks(520));
        self
    }

    pub fn build(self) -> PoolResult<Cluster> {
        let mut registry = DeviceRegistry::new(self.max_devices);
        registry.ensure_room_for(self.initial_devices)?;
        for _ in 0..self.initial_devices {
            registry.register_device(self.capacity)?;
        }
        let telemetry = Arc::clone(registry.telemetry());

        info!(
            devices = registry.len(),
            strategy = self.strategy.name(),
            dispatcher = self.dispatcher.name(),
            "Cluster initialized"
        );

        Ok(Cluster {
            inventory: RwLock::new(Inventory {
                registry,
                ledger: AllocationLedger::new(self.history_limit),
            }),
            telemetry,
            planner: Planner::new(self.strategy),
            dispatcher: self.dispatcher,
            standard_capacity: self.capacity,
            allocation: self.allocation,
            staleness: self.staleness,
        })
    }
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder {
            initial_devices: 0,
            capacity: DeviceCapacity::standard(),
            max_devices: None,
            history_limit: 1024,
            strategy: Arc::new(LowestIndexFirst),
            dispatcher: Arc::new(ImmediateDispatcher),
            allocation: AllocationConfig::default(),
            staleness: chrono::Duration::seconds(15),
        }
    }

    /// Build a cluster from engine configuration
    pub fn from_config(config: &EngineConfig) -> PoolResult<Self> {
        let strategy: Arc<dyn PlacementStrategy> = match config.allocation.strategy {
            PlacementPolicy::LowestIndexFirst => Arc::new(LowestIndexFirst),
            PlacementPolicy::LeastLoadedFirst => Arc::new(LeastLoadedFirst),
        };

        Self::builder()
            .strategy(strategy)
            .devices(config.pool.initial_devices)
            .capacity(config.pool.device_capacity)
            .max_devices(config.pool.max_devices)
            .history_limit(config.pool.finished_history)
            .allocation(config.allocation.clone())
            .staleness(Duration::from_millis(config.monitor.staleness_ms))
            .build()
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBoard> {
        &self.telemetry
    }

    /// Name of the placement strategy in use
    pub fn strategy_name(&self) -> &'static str {
        self.planner.strategy_name()
    }

    /// Record a telemetry reading; unknown devices are ignored
    pub fn update_telemetry(&self, device_id: DeviceId, reading: TelemetryReading) {
        self.telemetry.update(device_id, reading);
    }

    /// Register one device with an explicit capacity
    pub async fn register_device(&self, capacity: DeviceCapacity) -> PoolResult<DeviceId> {
        self.inventory.write().await.registry.register_device(capacity)
    }

    /// Remove one device; fails while any reservation references it
    pub async fn remove_device(&self, device_id: DeviceId) -> PoolResult<()> {
        let mut inventory = self.inventory.write().await;
        let Inventory { registry, ledger } = &mut *inventory;
        registry.remove_device(device_id, ledger).map(|_| ())
    }

    pub async fn get_device(&self, device_id: DeviceId) -> Option<DeviceView> {
        let inventory = self.inventory.read().await;
        inventory.registry.get_device(device_id, &inventory.ledger)
    }

    pub async fn list_devices(&self) -> Vec<DeviceView> {
        let inventory = self.inventory.read().await;
        inventory
            .registry
            .iter()
            .filter_map(|(id, _)| inventory.registry.get_device(id, &inventory.ledger))
            .collect()
    }

    pub async fn device_ids(&self) -> Vec<DeviceId> {
        self.inventory.read().await.registry.device_ids()
    }

    pub async fn device_count(&self) -> usize {
        self.inventory.read().await.registry.len()
    }

    /// Capacity committed on a device by live reservations
    pub async fn committed_on(&self, device_id: DeviceId) -> PoolResult<ResourceShare> {
        let inventory = self.inventory.read().await;
        if !inventory.registry.contains(device_id) {
            return Err(PoolError::DeviceNotFound(device_id));
        }
        Ok(inventory.ledger.committed_on(device_id))
    }

    /// Choose devices for a request without committing anything
    pub async fn plan(&self, request: &PlacementRequest) -> PoolResult<Vec<DeviceId>> {
        let inventory = self.inventory.read().await;
        self.planner
            .plan(&inventory.registry, &inventory.ledger, request)
    }

    /// Reserve capacity on an explicit device set, all or nothing
    pub async fn reserve(
        &self,
        device_ids: &[DeviceId],
        per_device: ResourceShare,
        owner: &str,
    ) -> PoolResult<AllocationId> {
        let mut inventory = self.inventory.write().await;
        let Inventory { registry, ledger } = &mut *inventory;
        ledger.reserve(registry, device_ids, per_device, owner)
    }

    /// Plan, reserve and confirm a request
    ///
    /// A plan that goes stale before it is committed is re-planned up to
    /// `plan_retries` times. On any failure no capacity remains committed.
    pub async fn allocate(&self, request: AllocationRequest) -> PoolResult<AllocationHandle> {
        let placement = request.placement()?;
        let terms = ReservationTerms {
            owner: request.owner.clone(),
            priority: request.priority,
            estimated_duration_secs: request.estimated_duration_secs,
        };

        let mut attempt = 0;
        let reservation = loop {
            let devices = self.plan(&placement).await?;

            let mut inventory = self.inventory.write().await;
            let Inventory { registry, ledger } = &mut *inventory;
            match ledger.reserve_pending(registry, &devices, placement.per_device, terms.clone()) {
                Ok(reservation) => break reservation,
                Err(err @ (PoolError::CapacityExceeded { .. } | PoolError::DeviceNotFound(_)))
                    if attempt < self.allocation.plan_retries =>
                {
                    attempt += 1;
                    warn!(
                        owner = %request.owner,
                        attempt,
                        error = %err,
                        "Plan went stale before commit, re-planning"
                    );
                }
                Err(err) => return Err(err),
            }
        };

        let allocation_id = reservation.allocation_id;
        let timeout = Duration::from_millis(self.allocation.confirm_timeout_ms);
        let outcome = match tokio::time::timeout(timeout, self.dispatcher.confirm(&reservation)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "confirmation timed out after {} ms",
                self.allocation.confirm_timeout_ms
            )),
        };

        let mut inventory = self.inventory.write().await;
        match outcome {
            Ok(()) => {
                let active = inventory.ledger.activate(allocation_id)?;
                info!(
                    allocation_id = %allocation_id,
                    owner = %active.owner,
                    priority = %active.priority,
                    devices = ?active.device_ids,
                    "Allocation active"
                );
                Ok(AllocationHandle {
                    allocation_id,
                    device_ids: active.device_ids,
                })
            }
            Err(reason) => {
                // Released concurrently while pending: nothing left to fail.
                if let Err(err) = inventory.ledger.fail(allocation_id, &reason) {
                    warn!(allocation_id = %allocation_id, error = %err, "Pending reservation vanished");
                }
                Err(PoolError::Confirmation {
                    allocation_id,
                    reason,
                })
            }
        }
    }

    /// Release an allocation and free its capacity
    pub async fn release(&self, allocation_id: AllocationId) -> PoolResult<Reservation> {
        self.inventory.write().await.ledger.release(allocation_id)
    }

    pub async fn get_allocation(&self, allocation_id: AllocationId) -> Option<Reservation> {
        self.inventory.read().await.ledger.get(allocation_id)
    }

    pub async fn list_active_allocations(&self) -> Vec<Reservation> {
        self.inventory
            .read()
            .await
            .ledger
            .list_active()
            .cloned()
            .collect()
    }

    /// Re-verify the capacity invariant over the whole ledger
    pub async fn audit(&self) -> PoolResult<()> {
        let inventory = self.inventory.read().await;
        inventory.ledger.audit(&inventory.registry)
    }

    /// Aggregate view over capacity, commitments and fresh telemetry
    pub async fn cluster_metrics(&self) -> ClusterMetrics {
        let (device_count, total_capacity, committed, active_reservations) = {
            let inventory = self.inventory.read().await;
            let total: ResourceShare = inventory
                .registry
                .iter()
                .map(|(_, cap)| cap.as_share())
                .sum();
            let committed: ResourceShare = inventory
                .registry
                .iter()
                .map(|(id, _)| inventory.ledger.committed_on(id))
                .sum();
            (
                inventory.registry.len(),
                total,
                committed,
                inventory.ledger.active_count(),
            )
        };

        let now = Utc::now();
        let fresh: Vec<TelemetryReading> = self
            .telemetry
            .snapshot()
            .into_values()
            .flatten()
            .filter(|r| !r.is_stale(now, self.staleness))
            .collect();

        let reporting = fresh.len();
        let mean = |values: Vec<f32>| -> Option<f32> {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f32>() / values.len() as f32)
            }
        };

        ClusterMetrics {
            device_count,
            reporting_devices: reporting,
            active_reservations,
            total_capacity,
            committed,
            average_utilization_pct: mean(fresh.iter().map(|r| r.metrics.utilization_pct).collect()),
            average_memory_usage_pct: mean(
                fresh.iter().map(|r| r.metrics.memory_usage_pct()).collect(),
            ),
            observed_power_watts: fresh.iter().map(|r| r.metrics.power_draw_watts).sum(),
            computed_at: now,
        }
    }

    /// Total, used and available capacity plus device occupancy
    pub async fn resource_status(&self) -> ResourceStatus {
        let inventory = self.inventory.read().await;
        let mut total = ResourceShare::ZERO;
        let mut used = ResourceShare::ZERO;
        let mut devices = DeviceCounts::default();

        for (device_id, capacity) in inventory.registry.iter() {
            total = total.saturating_add(capacity.as_share());
            used = used.saturating_add(inventory.ledger.committed_on(device_id));
            devices.total += 1;
            if inventory.ledger.reservations_on(device_id) == 0 {
                devices.idle += 1;
            } else {
                devices.busy += 1;
            }
        }

        ResourceStatus {
            total,
            available: total.saturating_sub(used),
            used,
            devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gpupool_core::{AllocationStatus, MetricsSnapshot};

    struct RejectingDispatcher;

    #[async_trait]
    impl WorkloadDispatcher for RejectingDispatcher {
        async fn confirm(&self, _reservation: &Reservation) -> PoolResult<()> {
            Err(PoolError::InvalidRequest("no worker slot".to_string()))
        }

        fn name(&self) -> &'static str {
            "rejecting"
        }
    }

    struct HangingDispatcher;

    #[async_trait]
    impl WorkloadDispatcher for HangingDispatcher {
        async fn confirm(&self, _reservation: &Reservation) -> PoolResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    fn cluster(devices: usize) -> Cluster {
        Cluster::builder().devices(devices).build().unwrap()
    }

    const GB: u64 = 1_000_000_000;

    #[tokio::test]
    async fn test_allocate_and_release() {
        let cluster = cluster(4);
        let handle = cluster
            .allocate(AllocationRequest::new("llm", 2).with_demand(40 * GB, 300, 100))
            .await
            .unwrap();
        assert_eq!(handle.device_ids, vec![0, 1]);

        let reservation = cluster.get_allocation(handle.allocation_id).await.unwrap();
        assert_eq!(reservation.status, AllocationStatus::Active);
        assert_eq!(cluster.list_active_allocations().await.len(), 1);

        cluster.release(handle.allocation_id).await.unwrap();
        assert_eq!(cluster.committed_on(0).await.unwrap(), ResourceShare::ZERO);
        assert!(cluster.list_active_allocations().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_confirmation_frees_capacity() {
        let cluster = Cluster::builder()
            .devices(2)
            .dispatcher(Arc::new(RejectingDispatcher))
            .build()
            .unwrap();

        let err = cluster
            .allocate(AllocationRequest::new("tts", 1).with_demand(10 * GB, 0, 0))
            .await
            .unwrap_err();
        let PoolError::Confirmation { allocation_id, .. } = &err else {
            panic!("expected confirmation error, got {err:?}");
        };
        let allocation_id = *allocation_id;

        assert_eq!(cluster.committed_on(0).await.unwrap(), ResourceShare::ZERO);
        assert_eq!(
            cluster.get_allocation(allocation_id).await.unwrap().status,
            AllocationStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout_fails_reservation() {
        let cluster = Cluster::builder()
            .devices(1)
            .dispatcher(Arc::new(HangingDispatcher))
            .allocation(AllocationConfig {
                confirm_timeout_ms: 50,
                plan_retries: 0,
                ..AllocationConfig::default()
            })
            .build()
            .unwrap();

        let err = cluster
            .allocate(AllocationRequest::new("analytics", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Confirmation { .. }));
        assert_eq!(cluster.resource_status().await.devices.idle, 1);
    }

    #[tokio::test]
    async fn test_committed_on_unknown_device() {
        let cluster = cluster(1);
        assert!(matches!(
            cluster.committed_on(5).await,
            Err(PoolError::DeviceNotFound(5))
        ));
    }

    #[tokio::test]
    async fn test_cluster_metrics_counts_fresh_telemetry_only() {
        let cluster = cluster(3);
        let mut busy = MetricsSnapshot::idle(100);
        busy.utilization_pct = 60.0;
        busy.power_draw_watts = 500.0;
        cluster.update_telemetry(0, TelemetryReading::new(busy.clone(), Utc::now()));
        cluster.update_telemetry(
            1,
            TelemetryReading::new(busy, Utc::now() - chrono::Duration::minutes(5)),
        );

        let metrics = cluster.cluster_metrics().await;
        assert_eq!(metrics.device_count, 3);
        assert_eq!(metrics.reporting_devices, 1);
        assert_eq!(metrics.average_utilization_pct, Some(60.0));
        assert_eq!(metrics.observed_power_watts, 500.0);
    }

    #[tokio::test]
    async fn test_resource_status() {
        let cluster = cluster(2);
        cluster
            .reserve(&[1], ResourceShare::new(GB, 100, 10), "llm")
            .await
            .unwrap();

        let status = cluster.resource_status().await;
        assert_eq!(status.devices.total, 2);
        assert_eq!(status.devices.busy, 1);
        assert_eq!(status.used, ResourceShare::new(GB, 100, 10));
        assert_eq!(
            status.available,
            status.total.saturating_sub(ResourceShare::new(GB, 100, 10))
        );
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = EngineConfig::default();
        config.pool.initial_devices = 3;
        let cluster = Cluster::from_config(&config).unwrap();
        assert_eq!(cluster.device_count().await, 3);
        assert_eq!(cluster.strategy_name(), "lowest-index-first");
    }

    #[tokio::test]
    async fn test_from_config_least_loaded() {
        let mut config = EngineConfig::default();
        config.pool.initial_devices = 3;
        config.allocation.strategy = PlacementPolicy::LeastLoadedFirst;
        let cluster = Cluster::from_config(&config).unwrap();
        assert_eq!(cluster.strategy_name(), "least-loaded-first");

        cluster
            .reserve(&[0], ResourceShare::new(10 * GB, 0, 0), "llm")
            .await
            .unwrap();
        let handle = cluster
            .allocate(AllocationRequest::new("tts", 2).with_demand(GB, 0, 0))
            .await
            .unwrap();
        assert_eq!(handle.device_ids, vec![1, 2]);
    }
}
