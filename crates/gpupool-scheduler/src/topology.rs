//! Runtime topology changes: expand, shrink and migrate

use gpupool_core::{AllocationId, AllocationStatus, DeviceId, PlacementRequest, PoolError, PoolResult};
use tracing::info;

use crate::cluster::{Cluster, Inventory};

impl Cluster {
    /// Register `count` devices with the pool's standard capacity
    ///
    /// All or nothing with respect to the cluster size ceiling. New devices
    /// have no telemetry until the next monitoring tick.
    pub async fn expand(&self, count: usize) -> PoolResult<Vec<DeviceId>> {
        let mut inventory = self.inventory.write().await;
        inventory.registry.ensure_room_for(count)?;

        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            added.push(inventory.registry.register_device(self.standard_capacity)?);
        }

        info!(
            added = ?added,
            devices = inventory.registry.len(),
            "Cluster expanded"
        );

        Ok(added)
    }

    /// Remove the `count` highest-indexed devices
    ///
    /// Fails without removing anything if any candidate still hosts a live
    /// reservation, or if the cluster would be left empty.
    pub async fn shrink(&self, count: usize) -> PoolResult<Vec<DeviceId>> {
        let mut inventory = self.inventory.write().await;
        let Inventory { registry, ledger } = &mut *inventory;

        let present = registry.len();
        if count >= present {
            return Err(PoolError::InsufficientDevices {
                requested: u32::try_from(count).unwrap_or(u32::MAX),
                present: u32::try_from(present).unwrap_or(u32::MAX),
            });
        }

        let candidates: Vec<DeviceId> = registry.device_ids().into_iter().rev().take(count).collect();
        let occupied: Vec<DeviceId> = candidates
            .iter()
            .copied()
            .filter(|id| ledger.reservations_on(*id) > 0)
            .collect();
        if !occupied.is_empty() {
            return Err(PoolError::WouldRemoveActiveReservations {
                device_ids: occupied,
            });
        }

        for device_id in &candidates {
            registry.remove_device(*device_id, ledger)?;
        }

        info!(
            removed = ?candidates,
            devices = registry.len(),
            "Cluster shrunk"
        );

        Ok(candidates)
    }

    /// Move an active allocation off its current devices and `excluded`
    ///
    /// Planning and the swap happen under one exclusive lock, so concurrent
    /// migrations of the same allocation serialize and observers never see
    /// the claim on both device sets or on neither. The allocation keeps its
    /// id. On failure the ledger is unchanged.
    pub async fn migrate(
        &self,
        allocation_id: AllocationId,
        excluded: &[DeviceId],
    ) -> PoolResult<Vec<DeviceId>> {
        let mut inventory = self.inventory.write().await;
        let Inventory { registry, ledger } = &mut *inventory;

        let reservation = ledger
            .get(allocation_id)
            .filter(|r| r.status.is_live())
            .ok_or(PoolError::AllocationNotFound(allocation_id))?;
        if reservation.status != AllocationStatus::Active {
            return Err(PoolError::InvalidRequest(format!(
                "allocation {} is {}, only Active allocations can migrate",
                allocation_id, reservation.status
            )));
        }

        let mut request = PlacementRequest::new(
            u32::try_from(reservation.device_ids.len()).unwrap_or(u32::MAX),
            reservation.per_device,
        );
        request.exclude.extend(excluded.iter().copied());
        request.exclude.extend(reservation.device_ids.iter().copied());

        let target = self.planner.plan(registry, ledger, &request)?;
        let moved = ledger.relocate(registry, allocation_id, &target)?;

        info!(
            allocation_id = %allocation_id,
            from = ?reservation.device_ids,
            to = ?moved.device_ids,
            "Allocation migrated"
        );

        Ok(moved.device_ids)
    }
}
