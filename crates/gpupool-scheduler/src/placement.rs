//! Placement planning: choose devices for a request without committing

use gpupool_core::{DeviceId, PlacementRequest, PoolError, PoolResult, Resource, ResourceShare};
use std::sync::Arc;
use tracing::debug;

use crate::ledger::AllocationLedger;
use crate::registry::DeviceRegistry;

/// A device that can host one share of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub device_id: DeviceId,
    /// Capacity still uncommitted on the device
    pub free: ResourceShare,
}

/// Strategy for ordering feasible devices; the planner takes the first `k`
pub trait PlacementStrategy: Send + Sync {
    /// Order candidates by preference. Must be deterministic.
    fn rank(&self, candidates: &mut [Candidate]);

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

/// Ascending device id
pub struct LowestIndexFirst;

impl PlacementStrategy for LowestIndexFirst {
    fn rank(&self, candidates: &mut [Candidate]) {
        candidates.sort_by_key(|c| c.device_id);
    }

    fn name(&self) -> &'static str {
        "lowest-index-first"
    }
}

/// Most free memory first, ties broken by ascending device id
pub struct LeastLoadedFirst;

impl PlacementStrategy for LeastLoadedFirst {
    fn rank(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| {
            b.free
                .memory_bytes
                .cmp(&a.free.memory_bytes)
                .then(a.device_id.cmp(&b.device_id))
        });
    }

    fn name(&self) -> &'static str {
        "least-loaded-first"
    }
}

/// Selects feasible device sets; never mutates the ledger
#[derive(Clone)]
pub struct Planner {
    strategy: Arc<dyn PlacementStrategy>,
}

impl Planner {
    pub fn new(strategy: Arc<dyn PlacementStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Pick `request.device_count` devices that each have room for
    /// `request.per_device`, returned in ascending id order
    pub fn plan(
        &self,
        registry: &DeviceRegistry,
        ledger: &AllocationLedger,
        request: &PlacementRequest,
    ) -> PoolResult<Vec<DeviceId>> {
        if request.device_count == 0 {
            return Err(PoolError::InvalidRequest(
                "device_count must be at least 1".to_string(),
            ));
        }

        let peak = registry.peak_capacity();
        if let Some(resource) = request.per_device.first_exceeding(&peak) {
            return Err(PoolError::RequestExceedsDeviceCapacity {
                resource,
                requested: request.per_device.get(resource),
                capacity: peak.get(resource),
            });
        }

        // Peak is per dimension; with mixed device sizes it can pass a share
        // that no single device offers.
        if let Some(err) = exceeds_every_device(registry, &request.per_device) {
            return Err(err);
        }

        let mut candidates = Vec::with_capacity(registry.len());
        for (device_id, _) in registry.iter() {
            if request.exclude.contains(&device_id) {
                continue;
            }
            let free = ledger.headroom(registry, device_id)?;
            if request.per_device.fits_within(&free) {
                candidates.push(Candidate { device_id, free });
            }
        }

        let wanted = request.device_count as usize;
        if candidates.len() < wanted {
            return Err(PoolError::InsufficientCapacity {
                requested: request.device_count,
                available: candidates.len() as u32,
            });
        }

        self.strategy.rank(&mut candidates);
        let mut selected: Vec<DeviceId> = candidates
            .iter()
            .take(wanted)
            .map(|c| c.device_id)
            .collect();
        selected.sort_unstable();

        debug!(
            strategy = self.strategy.name(),
            devices = ?selected,
            "Placement planned"
        );

        Ok(selected)
    }
}

/// The error for a share that no registered device could ever host, even
/// empty; `None` when some device fits it or the registry is empty
fn exceeds_every_device(registry: &DeviceRegistry, share: &ResourceShare) -> Option<PoolError> {
    let mut closest: Option<(usize, Resource, u64)> = None;
    for (_, capacity) in registry.iter() {
        let limit = capacity.as_share();
        let missed = Resource::ALL
            .iter()
            .filter(|r| share.get(**r) > limit.get(**r))
            .count();
        let Some(resource) = share.first_exceeding(&limit) else {
            return None;
        };
        if closest.map_or(true, |(fewest, _, _)| missed < fewest) {
            closest = Some((missed, resource, limit.get(resource)));
        }
    }

    closest.map(|(_, resource, capacity)| PoolError::RequestExceedsDeviceCapacity {
        resource,
        requested: share.get(resource),
        capacity,
    })
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(Arc::new(LowestIndexFirst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpupool_core::DeviceCapacity;

    fn setup(count: usize) -> (DeviceRegistry, AllocationLedger) {
        let mut registry = DeviceRegistry::new(None);
        for _ in 0..count {
            registry
                .register_device(DeviceCapacity {
                    memory_bytes: 183,
                    compute_units: 148,
                    max_power_watts: 900,
                    interconnect_gbps: 1800,
                })
                .unwrap();
        }
        (registry, AllocationLedger::new(16))
    }

    fn request(k: u32, memory: u64) -> PlacementRequest {
        PlacementRequest::new(k, ResourceShare::new(memory, 0, 0))
    }

    #[test]
    fn test_lowest_index_first() {
        let (registry, ledger) = setup(8);
        let planner = Planner::default();
        assert_eq!(
            planner.plan(&registry, &ledger, &request(4, 45)).unwrap(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_plan_is_deterministic_and_pure() {
        let (registry, ledger) = setup(8);
        let planner = Planner::default();
        let first = planner.plan(&registry, &ledger, &request(3, 100)).unwrap();
        let second = planner.plan(&registry, &ledger, &request(3, 100)).unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.live_count(), 0);
    }

    #[test]
    fn test_exceeds_single_device() {
        let (registry, ledger) = setup(8);
        let err = Planner::default()
            .plan(&registry, &ledger, &request(1, 200))
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::RequestExceedsDeviceCapacity {
                resource: Resource::Memory,
                requested: 200,
                capacity: 183
            }
        ));
    }

    #[test]
    fn test_mixed_sizes_no_single_device_fits() {
        let mut registry = DeviceRegistry::new(None);
        for (memory, power) in [(200, 100), (100, 900)] {
            registry
                .register_device(DeviceCapacity {
                    memory_bytes: memory,
                    compute_units: 1,
                    max_power_watts: power,
                    interconnect_gbps: 10,
                })
                .unwrap();
        }
        let ledger = AllocationLedger::new(16);

        // Under the per-dimension peak (200, 900) but too big for either device.
        let req = PlacementRequest::new(1, ResourceShare::new(150, 500, 0));
        let err = Planner::default().plan(&registry, &ledger, &req).unwrap_err();
        assert!(matches!(
            err,
            PoolError::RequestExceedsDeviceCapacity {
                resource: Resource::Power,
                requested: 500,
                capacity: 100
            }
        ));
        assert!(!err.is_retryable());

        let fits = PlacementRequest::new(1, ResourceShare::new(150, 100, 0));
        assert_eq!(
            Planner::default().plan(&registry, &ledger, &fits).unwrap(),
            vec![0]
        );
    }

    #[test]
    fn test_zero_share_on_empty_registry_is_insufficient() {
        let registry = DeviceRegistry::new(None);
        let ledger = AllocationLedger::new(16);
        assert!(matches!(
            Planner::default().plan(&registry, &ledger, &request(1, 0)),
            Err(PoolError::InsufficientCapacity {
                requested: 1,
                available: 0
            })
        ));
    }

    #[test]
    fn test_insufficient_capacity_reports_shortfall() {
        let (registry, mut ledger) = setup(8);
        ledger
            .reserve(&registry, &[0, 1, 2, 3], ResourceShare::new(150, 0, 0), "llm")
            .unwrap();

        let err = Planner::default()
            .plan(&registry, &ledger, &request(5, 50))
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::InsufficientCapacity {
                requested: 5,
                available: 4
            }
        ));
    }

    #[test]
    fn test_exclusion_list_respected() {
        let (registry, ledger) = setup(4);
        let mut req = request(2, 10);
        req.exclude.extend([0, 2]);
        assert_eq!(
            Planner::default().plan(&registry, &ledger, &req).unwrap(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_partially_used_device_still_eligible() {
        let (registry, mut ledger) = setup(2);
        ledger
            .reserve(&registry, &[0], ResourceShare::new(100, 0, 0), "tts")
            .unwrap();
        assert_eq!(
            Planner::default()
                .plan(&registry, &ledger, &request(2, 83))
                .unwrap(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_least_loaded_first() {
        let (registry, mut ledger) = setup(4);
        ledger
            .reserve(&registry, &[0, 1], ResourceShare::new(100, 0, 0), "llm")
            .unwrap();
        ledger
            .reserve(&registry, &[3], ResourceShare::new(10, 0, 0), "tts")
            .unwrap();

        let planner = Planner::new(Arc::new(LeastLoadedFirst));
        assert_eq!(
            planner.plan(&registry, &ledger, &request(2, 10)).unwrap(),
            vec![2, 3]
        );
    }

    #[test]
    fn test_zero_devices_rejected() {
        let (registry, ledger) = setup(1);
        assert!(matches!(
            Planner::default().plan(&registry, &ledger, &request(0, 1)),
            Err(PoolError::InvalidRequest(_))
        ));
    }
}
