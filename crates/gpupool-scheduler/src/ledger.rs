//! Allocation ledger: reservations and the capacity they commit
//!
//! The ledger is a plain data structure; callers serialize access to it
//! together with the device registry (see [`crate::cluster::Inventory`]), so
//! every check-then-commit sequence here runs under a single exclusive borrow.

use chrono::Utc;
use gpupool_core::{
    AllocationId, AllocationStatus, DeviceId, PoolError, PoolResult, Priority, Reservation,
    ResourceShare,
};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::registry::DeviceRegistry;

/// Bookkeeping attached to a new reservation
#[derive(Debug, Clone)]
pub struct ReservationTerms {
    pub owner: String,
    pub priority: Priority,
    pub estimated_duration_secs: Option<u64>,
}

impl ReservationTerms {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            priority: Priority::Normal,
            estimated_duration_secs: None,
        }
    }
}

/// Maps allocation ids to reservations and enforces per-device capacity
pub struct AllocationLedger {
    /// Pending and active reservations; these hold capacity
    live: HashMap<AllocationId, Reservation>,
    /// Completed and failed reservations, oldest first
    finished: VecDeque<Reservation>,
    history_limit: usize,
}

impl AllocationLedger {
    /// Create an empty ledger retaining up to `history_limit` finished records
    pub fn new(history_limit: usize) -> Self {
        Self {
            live: HashMap::new(),
            finished: VecDeque::new(),
            history_limit,
        }
    }

    /// Capacity committed on a device by live reservations
    pub fn committed_on(&self, device_id: DeviceId) -> ResourceShare {
        self.committed_excluding(device_id, None)
    }

    fn committed_excluding(&self, device_id: DeviceId, skip: Option<AllocationId>) -> ResourceShare {
        self.live
            .values()
            .filter(|r| Some(r.allocation_id) != skip && r.touches(device_id))
            .map(|r| r.per_device)
            .sum()
    }

    /// Number of live reservations touching a device
    pub fn reservations_on(&self, device_id: DeviceId) -> usize {
        self.live.values().filter(|r| r.touches(device_id)).count()
    }

    /// Uncommitted capacity on a device
    ///
    /// This is the one feasibility formula shared by planning and committing.
    pub fn headroom(&self, registry: &DeviceRegistry, device_id: DeviceId) -> PoolResult<ResourceShare> {
        self.headroom_excluding(registry, device_id, None)
    }

    fn headroom_excluding(
        &self,
        registry: &DeviceRegistry,
        device_id: DeviceId,
        skip: Option<AllocationId>,
    ) -> PoolResult<ResourceShare> {
        let capacity = registry
            .capacity(device_id)
            .ok_or(PoolError::DeviceNotFound(device_id))?;
        Ok(capacity
            .as_share()
            .saturating_sub(self.committed_excluding(device_id, skip)))
    }

    /// Check that `per_device` fits on every device; commits nothing
    fn check_fits(
        &self,
        registry: &DeviceRegistry,
        device_ids: &[DeviceId],
        per_device: ResourceShare,
        skip: Option<AllocationId>,
    ) -> PoolResult<()> {
        for &device_id in device_ids {
            let headroom = self.headroom_excluding(registry, device_id, skip)?;
            if let Some(resource) = per_device.first_exceeding(&headroom) {
                return Err(PoolError::CapacityExceeded {
                    device_id,
                    resource,
                });
            }
        }
        Ok(())
    }

    /// Non-empty, duplicate-free, ascending copy of a device set
    fn normalize(device_ids: &[DeviceId]) -> PoolResult<Vec<DeviceId>> {
        if device_ids.is_empty() {
            return Err(PoolError::InvalidRequest(
                "reservation needs at least one device".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(device_ids.len());
        if let Some(dup) = device_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(PoolError::InvalidRequest(format!(
                "device {} listed more than once",
                dup
            )));
        }
        let mut ids = device_ids.to_vec();
        ids.sort_unstable();
        Ok(ids)
    }

    fn commit(
        &mut self,
        registry: &DeviceRegistry,
        device_ids: &[DeviceId],
        per_device: ResourceShare,
        terms: ReservationTerms,
        status: AllocationStatus,
    ) -> PoolResult<Reservation> {
        let device_ids = Self::normalize(device_ids)?;
        self.check_fits(registry, &device_ids, per_device, None)?;

        let mut reservation = Reservation::new(terms.owner, device_ids, per_device, status)
            .with_estimate(terms.estimated_duration_secs);
        reservation.priority = terms.priority;

        info!(
            allocation_id = %reservation.allocation_id,
            owner = %reservation.owner,
            devices = ?reservation.device_ids,
            status = %status,
            "Reserved capacity"
        );

        self.live
            .insert(reservation.allocation_id, reservation.clone());
        Ok(reservation)
    }

    /// Atomically reserve `per_device` on every listed device, or nothing
    pub fn reserve(
        &mut self,
        registry: &DeviceRegistry,
        device_ids: &[DeviceId],
        per_device: ResourceShare,
        owner: &str,
    ) -> PoolResult<AllocationId> {
        self.commit(
            registry,
            device_ids,
            per_device,
            ReservationTerms::new(owner),
            AllocationStatus::Active,
        )
        .map(|r| r.allocation_id)
    }

    /// Reserve capacity in `Pending` state, awaiting confirmation
    pub fn reserve_pending(
        &mut self,
        registry: &DeviceRegistry,
        device_ids: &[DeviceId],
        per_device: ResourceShare,
        terms: ReservationTerms,
    ) -> PoolResult<Reservation> {
        self.commit(
            registry,
            device_ids,
            per_device,
            terms,
            AllocationStatus::Pending,
        )
    }

    /// Move a pending reservation to `Active`
    pub fn activate(&mut self, allocation_id: AllocationId) -> PoolResult<Reservation> {
        let reservation = self
            .live
            .get_mut(&allocation_id)
            .ok_or(PoolError::AllocationNotFound(allocation_id))?;

        if reservation.status != AllocationStatus::Pending {
            return Err(PoolError::InvalidRequest(format!(
                "allocation {} is {}, not Pending",
                allocation_id, reservation.status
            )));
        }

        reservation.status = AllocationStatus::Active;
        reservation.updated_at = Utc::now();
        debug!(allocation_id = %allocation_id, "Reservation activated");
        Ok(reservation.clone())
    }

    /// Mark a live reservation `Failed` and free its capacity
    pub fn fail(&mut self, allocation_id: AllocationId, reason: &str) -> PoolResult<Reservation> {
        let mut reservation = self
            .live
            .remove(&allocation_id)
            .ok_or(PoolError::AllocationNotFound(allocation_id))?;

        reservation.status = AllocationStatus::Failed;
        reservation.failure_reason = Some(reason.to_string());
        reservation.updated_at = Utc::now();

        warn!(
            allocation_id = %allocation_id,
            reason = %reason,
            "Reservation failed"
        );

        self.retire(reservation.clone());
        Ok(reservation)
    }

    /// Mark a reservation `Completed` and free its capacity
    ///
    /// A second release of the same id fails with `AllocationNotFound`.
    pub fn release(&mut self, allocation_id: AllocationId) -> PoolResult<Reservation> {
        let mut reservation = self
            .live
            .remove(&allocation_id)
            .ok_or(PoolError::AllocationNotFound(allocation_id))?;

        reservation.status = AllocationStatus::Completed;
        reservation.updated_at = Utc::now();

        info!(
            allocation_id = %allocation_id,
            devices = ?reservation.device_ids,
            "Released reservation"
        );

        self.retire(reservation.clone());
        Ok(reservation)
    }

    /// Swap an active reservation onto a new device set in one step
    ///
    /// The new devices are checked with this reservation's own claim
    /// discounted, then the claim moves; no observer sees both or neither.
    pub fn relocate(
        &mut self,
        registry: &DeviceRegistry,
        allocation_id: AllocationId,
        device_ids: &[DeviceId],
    ) -> PoolResult<Reservation> {
        let (per_device, current_len) = match self.live.get(&allocation_id) {
            Some(r) if r.status == AllocationStatus::Active => (r.per_device, r.device_ids.len()),
            Some(r) => {
                return Err(PoolError::InvalidRequest(format!(
                    "allocation {} is {}, only Active reservations can move",
                    allocation_id, r.status
                )))
            }
            None => return Err(PoolError::AllocationNotFound(allocation_id)),
        };

        let device_ids = Self::normalize(device_ids)?;
        if device_ids.len() != current_len {
            return Err(PoolError::InvalidRequest(format!(
                "relocation must keep {} devices, got {}",
                current_len,
                device_ids.len()
            )));
        }
        self.check_fits(registry, &device_ids, per_device, Some(allocation_id))?;

        let reservation = self
            .live
            .get_mut(&allocation_id)
            .ok_or(PoolError::AllocationNotFound(allocation_id))?;
        let previous = std::mem::replace(&mut reservation.device_ids, device_ids);
        reservation.migrations += 1;
        reservation.updated_at = Utc::now();

        info!(
            allocation_id = %allocation_id,
            from = ?previous,
            to = ?reservation.device_ids,
            "Relocated reservation"
        );

        Ok(reservation.clone())
    }

    fn retire(&mut self, reservation: Reservation) {
        if self.history_limit == 0 {
            return;
        }
        while self.finished.len() >= self.history_limit {
            self.finished.pop_front();
        }
        self.finished.push_back(reservation);
    }

    /// Look up a reservation, live or recently finished
    pub fn get(&self, allocation_id: AllocationId) -> Option<Reservation> {
        self.live.get(&allocation_id).cloned().or_else(|| {
            self.finished
                .iter()
                .rev()
                .find(|r| r.allocation_id == allocation_id)
                .cloned()
        })
    }

    /// Reservations in `Active` state, oldest first
    pub fn list_active(&self) -> impl Iterator<Item = &Reservation> {
        let mut active: Vec<&Reservation> = self
            .live
            .values()
            .filter(|r| r.status == AllocationStatus::Active)
            .collect();
        active.sort_by_key(|r| (r.created_at, r.allocation_id));
        active.into_iter()
    }

    /// Number of live (pending or active) reservations
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn active_count(&self) -> usize {
        self.live
            .values()
            .filter(|r| r.status == AllocationStatus::Active)
            .count()
    }

    /// Re-verify that no device is oversubscribed and every live
    /// reservation points at registered devices
    pub fn audit(&self, registry: &DeviceRegistry) -> PoolResult<()> {
        for reservation in self.live.values() {
            if let Some(missing) = reservation
                .device_ids
                .iter()
                .find(|id| !registry.contains(**id))
            {
                return Err(PoolError::InvariantViolation(format!(
                    "allocation {} references unregistered device {}",
                    reservation.allocation_id, missing
                )));
            }
        }

        for (device_id, capacity) in registry.iter() {
            let committed = self.committed_on(device_id);
            if let Some(resource) = committed.first_exceeding(&capacity.as_share()) {
                return Err(PoolError::InvariantViolation(format!(
                    "device {} oversubscribed on {}: committed {}, capacity {}",
                    device_id,
                    resource,
                    committed.get(resource),
                    capacity.as_share().get(resource)
                )));
            }
        }

        Ok(())
    }
}
