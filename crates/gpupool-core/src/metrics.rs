//! Derived cluster-wide views

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::ResourceShare;

/// Aggregate view of the cluster, computed on demand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub device_count: usize,
    /// Devices whose telemetry is present and fresh
    pub reporting_devices: usize,
    pub active_reservations: usize,
    /// Sum of static capacity over all devices
    pub total_capacity: ResourceShare,
    /// Sum of capacity committed by live reservations
    pub committed: ResourceShare,
    /// Mean utilization over reporting devices
    pub average_utilization_pct: Option<f32>,
    /// Mean memory usage over reporting devices, as observed by telemetry
    pub average_memory_usage_pct: Option<f32>,
    /// Total observed power draw over reporting devices
    pub observed_power_watts: f32,
    pub computed_at: DateTime<Utc>,
}

impl ClusterMetrics {
    pub fn available(&self) -> ResourceShare {
        self.total_capacity.saturating_sub(self.committed)
    }

    /// Fraction of memory capacity committed, 0-100
    pub fn memory_commitment_pct(&self) -> f32 {
        if self.total_capacity.memory_bytes == 0 {
            return 0.0;
        }
        (self.committed.memory_bytes as f64 / self.total_capacity.memory_bytes as f64 * 100.0)
            as f32
    }
}

/// Device counts by occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCounts {
    pub total: usize,
    /// Devices with no live reservation
    pub idle: usize,
    pub busy: usize,
}

/// `{ total, available, used }` snapshot for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub total: ResourceShare,
    pub available: ResourceShare,
    pub used: ResourceShare,
    pub devices: DeviceCounts,
}
