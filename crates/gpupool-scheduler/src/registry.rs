//! Device registry: static capacity per device slot plus latest telemetry

use gpupool_core::{
    DeviceCapacity, DeviceId, DeviceView, PoolError, PoolResult, ResourceShare, TelemetryReading,
};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::ledger::AllocationLedger;

type ReadingsMap = BTreeMap<DeviceId, Option<TelemetryReading>>;

/// Latest telemetry per device
///
/// Synchronized on its own, independently of capacity bookkeeping, so that
/// telemetry refresh never waits on allocation traffic and vice versa.
#[derive(Debug, Default)]
pub struct TelemetryBoard {
    readings: RwLock<ReadingsMap>,
}

impl TelemetryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track(&self, device_id: DeviceId) {
        self.readings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id, None);
    }

    pub(crate) fn untrack(&self, device_id: DeviceId) {
        self.readings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device_id);
    }

    /// Overwrite the reading for a device
    ///
    /// Returns false, and stores nothing, when the device is not registered
    /// (it may have been removed while a refresh was in flight).
    pub fn update(&self, device_id: DeviceId, reading: TelemetryReading) -> bool {
        let mut readings = self.readings.write().unwrap_or_else(PoisonError::into_inner);
        match readings.get_mut(&device_id) {
            Some(slot) => {
                *slot = Some(reading);
                true
            }
            None => {
                debug!(device_id, "Ignoring telemetry for unregistered device");
                false
            }
        }
    }

    pub fn latest(&self, device_id: DeviceId) -> Option<TelemetryReading> {
        self.readings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id)
            .cloned()
            .flatten()
    }

    /// Copy of every tracked device's latest reading
    pub fn snapshot(&self) -> ReadingsMap {
        self.readings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Table of registered devices
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceCapacity>,
    /// Next id to hand out; ids are never reused
    next_id: DeviceId,
    /// Hard ceiling on cluster size, if any
    max_devices: Option<usize>,
    /// Per-dimension maximum over all registered capacities
    peak: ResourceShare,
    telemetry: Arc<TelemetryBoard>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new(max_devices: Option<usize>) -> Self {
        Self {
            devices: BTreeMap::new(),
            next_id: 0,
            max_devices,
            peak: ResourceShare::ZERO,
            telemetry: Arc::new(TelemetryBoard::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.devices.contains_key(&device_id)
    }

    pub fn capacity(&self, device_id: DeviceId) -> Option<DeviceCapacity> {
        self.devices.get(&device_id).copied()
    }

    /// Registered devices in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &DeviceCapacity)> {
        self.devices.iter().map(|(id, cap)| (*id, cap))
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    /// Largest capacity any single device offers, per dimension
    pub fn peak_capacity(&self) -> ResourceShare {
        self.peak
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBoard> {
        &self.telemetry
    }

    /// Fail unless `count` more devices fit under the ceiling
    pub fn ensure_room_for(&self, count: usize) -> PoolResult<()> {
        match self.max_devices {
            Some(max) if self.devices.len().saturating_add(count) > max => {
                Err(PoolError::ClusterSizeLimit { max })
            }
            _ => Ok(()),
        }
    }

    /// Add a device with the given static capacity
    pub fn register_device(&mut self, capacity: DeviceCapacity) -> PoolResult<DeviceId> {
        self.ensure_room_for(1)?;

        let device_id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| PoolError::InvalidRequest("device id space exhausted".to_string()))?;

        self.devices.insert(device_id, capacity);
        self.peak = self.peak.max(capacity.as_share());
        self.telemetry.track(device_id);

        info!(
            device_id,
            memory_bytes = capacity.memory_bytes,
            compute_units = capacity.compute_units,
            "Registered device"
        );

        Ok(device_id)
    }

    /// Remove a device that no live reservation references
    pub fn remove_device(
        &mut self,
        device_id: DeviceId,
        ledger: &AllocationLedger,
    ) -> PoolResult<DeviceCapacity> {
        if !self.devices.contains_key(&device_id) {
            return Err(PoolError::DeviceNotFound(device_id));
        }

        let reservations = ledger.reservations_on(device_id);
        if reservations > 0 {
            return Err(PoolError::DeviceNotEmpty {
                device_id,
                reservations,
            });
        }

        let capacity = self
            .devices
            .remove(&device_id)
            .ok_or(PoolError::DeviceNotFound(device_id))?;
        self.peak = self
            .devices
            .values()
            .fold(ResourceShare::ZERO, |peak, cap| peak.max(cap.as_share()));
        self.telemetry.untrack(device_id);

        info!(device_id, "Removed device");

        Ok(capacity)
    }

    /// Record a telemetry reading; unknown devices are ignored
    pub fn update_telemetry(&self, device_id: DeviceId, reading: TelemetryReading) {
        self.telemetry.update(device_id, reading);
    }

    /// Read-only snapshot of one device
    pub fn get_device(&self, device_id: DeviceId, ledger: &AllocationLedger) -> Option<DeviceView> {
        let capacity = self.capacity(device_id)?;
        Some(DeviceView {
            device_id,
            capacity,
            committed: ledger.committed_on(device_id),
            reservations: ledger.reservations_on(device_id),
            last_telemetry: self.telemetry.latest(device_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gpupool_core::{MetricsSnapshot, ResourceShare};

    fn small() -> DeviceCapacity {
        DeviceCapacity {
            memory_bytes: 100,
            compute_units: 4,
            max_power_watts: 50,
            interconnect_gbps: 10,
        }
    }

    #[test]
    fn test_register_assigns_ascending_ids() {
        let mut registry = DeviceRegistry::new(None);
        assert_eq!(registry.register_device(small()).unwrap(), 0);
        assert_eq!(registry.register_device(small()).unwrap(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.device_ids(), vec![0, 1]);
    }

    #[test]
    fn test_ceiling_enforced() {
        let mut registry = DeviceRegistry::new(Some(1));
        registry.register_device(small()).unwrap();
        assert!(matches!(
            registry.register_device(small()),
            Err(PoolError::ClusterSizeLimit { max: 1 })
        ));
    }

    #[test]
    fn test_ids_not_reused_after_removal() {
        let mut registry = DeviceRegistry::new(None);
        let ledger = AllocationLedger::new(16);
        registry.register_device(small()).unwrap();
        let last = registry.register_device(small()).unwrap();
        registry.remove_device(last, &ledger).unwrap();
        assert_eq!(registry.register_device(small()).unwrap(), 2);
    }

    #[test]
    fn test_remove_blocked_by_reservation() {
        let mut registry = DeviceRegistry::new(None);
        let mut ledger = AllocationLedger::new(16);
        let id = registry.register_device(small()).unwrap();
        ledger
            .reserve(&registry, &[id], ResourceShare::new(10, 1, 1), "llm")
            .unwrap();

        let err = registry.remove_device(id, &ledger).unwrap_err();
        assert!(matches!(
            err,
            PoolError::DeviceNotEmpty {
                device_id: 0,
                reservations: 1
            }
        ));
        assert!(registry.contains(id));
    }

    #[test]
    fn test_remove_unknown_device() {
        let mut registry = DeviceRegistry::new(None);
        let ledger = AllocationLedger::new(16);
        assert!(matches!(
            registry.remove_device(7, &ledger),
            Err(PoolError::DeviceNotFound(7))
        ));
    }

    #[test]
    fn test_peak_capacity_tracks_removals() {
        let mut registry = DeviceRegistry::new(None);
        let ledger = AllocationLedger::new(16);
        registry.register_device(small()).unwrap();
        let big = registry
            .register_device(DeviceCapacity {
                memory_bytes: 500,
                ..small()
            })
            .unwrap();
        assert_eq!(registry.peak_capacity().memory_bytes, 500);

        registry.remove_device(big, &ledger).unwrap();
        assert_eq!(registry.peak_capacity().memory_bytes, 100);
    }

    #[test]
    fn test_telemetry_for_unknown_device_ignored() {
        let mut registry = DeviceRegistry::new(None);
        let ledger = AllocationLedger::new(16);
        let id = registry.register_device(small()).unwrap();
        let reading = TelemetryReading::new(MetricsSnapshot::idle(100), Utc::now());

        registry.update_telemetry(42, reading.clone());
        assert!(registry.telemetry().latest(42).is_none());

        registry.update_telemetry(id, reading.clone());
        let view = registry.get_device(id, &ledger).unwrap();
        assert_eq!(view.last_telemetry, Some(reading));
    }

    #[test]
    fn test_removed_device_drops_telemetry() {
        let mut registry = DeviceRegistry::new(None);
        let ledger = AllocationLedger::new(16);
        let id = registry.register_device(small()).unwrap();
        registry.update_telemetry(
            id,
            TelemetryReading::new(MetricsSnapshot::idle(100), Utc::now()),
        );
        registry.remove_device(id, &ledger).unwrap();
        assert!(registry.telemetry().snapshot().is_empty());
    }
}
