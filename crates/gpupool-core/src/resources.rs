//! Resource quantities claimed against a device

use serde::{Deserialize, Serialize};

/// One of the three capacity dimensions tracked per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Memory,
    Power,
    Bandwidth,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Memory, Resource::Power, Resource::Bandwidth];
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Memory => write!(f, "memory"),
            Resource::Power => write!(f, "power"),
            Resource::Bandwidth => write!(f, "bandwidth"),
        }
    }
}

/// A quantity of memory, power and interconnect bandwidth
///
/// Used both for what a reservation claims on a single device and for
/// committed/free totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShare {
    /// Memory in bytes
    pub memory_bytes: u64,
    /// Power budget in watts
    pub power_watts: u64,
    /// Interconnect bandwidth in GB/s
    pub bandwidth_gbps: u64,
}

impl ResourceShare {
    pub const ZERO: ResourceShare = ResourceShare {
        memory_bytes: 0,
        power_watts: 0,
        bandwidth_gbps: 0,
    };

    pub fn new(memory_bytes: u64, power_watts: u64, bandwidth_gbps: u64) -> Self {
        Self {
            memory_bytes,
            power_watts,
            bandwidth_gbps,
        }
    }

    /// Value along a single dimension
    pub fn get(&self, resource: Resource) -> u64 {
        match resource {
            Resource::Memory => self.memory_bytes,
            Resource::Power => self.power_watts,
            Resource::Bandwidth => self.bandwidth_gbps,
        }
    }

    pub fn saturating_add(self, other: ResourceShare) -> ResourceShare {
        ResourceShare {
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            power_watts: self.power_watts.saturating_add(other.power_watts),
            bandwidth_gbps: self.bandwidth_gbps.saturating_add(other.bandwidth_gbps),
        }
    }

    pub fn saturating_sub(self, other: ResourceShare) -> ResourceShare {
        ResourceShare {
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            power_watts: self.power_watts.saturating_sub(other.power_watts),
            bandwidth_gbps: self.bandwidth_gbps.saturating_sub(other.bandwidth_gbps),
        }
    }

    pub fn saturating_mul(self, factor: u64) -> ResourceShare {
        ResourceShare {
            memory_bytes: self.memory_bytes.saturating_mul(factor),
            power_watts: self.power_watts.saturating_mul(factor),
            bandwidth_gbps: self.bandwidth_gbps.saturating_mul(factor),
        }
    }

    /// Even split of a total across `parts` devices, rounded up so the
    /// per-device shares never sum to less than the total
    pub fn split_even(self, parts: u64) -> ResourceShare {
        if parts == 0 {
            return self;
        }
        ResourceShare {
            memory_bytes: self.memory_bytes.div_ceil(parts),
            power_watts: self.power_watts.div_ceil(parts),
            bandwidth_gbps: self.bandwidth_gbps.div_ceil(parts),
        }
    }

    /// First dimension on which `self` does not fit within `limit`
    pub fn first_exceeding(&self, limit: &ResourceShare) -> Option<Resource> {
        Resource::ALL
            .into_iter()
            .find(|r| self.get(*r) > limit.get(*r))
    }

    pub fn fits_within(&self, limit: &ResourceShare) -> bool {
        self.first_exceeding(limit).is_none()
    }

    /// Per-dimension maximum
    pub fn max(self, other: ResourceShare) -> ResourceShare {
        ResourceShare {
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
            power_watts: self.power_watts.max(other.power_watts),
            bandwidth_gbps: self.bandwidth_gbps.max(other.bandwidth_gbps),
        }
    }
}

impl std::iter::Sum for ResourceShare {
    fn sum<I: Iterator<Item = ResourceShare>>(iter: I) -> Self {
        iter.fold(ResourceShare::ZERO, ResourceShare::saturating_add)
    }
}
