//! Accelerator devices: static capacity and observed telemetry

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::ResourceShare;

/// Stable device index, unique within a registry and never reused while present
pub type DeviceId = u32;

const GB: u64 = 1_000_000_000;

/// Static capacity of a device, fixed at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapacity {
    /// Memory capacity in bytes
    pub memory_bytes: u64,
    /// Number of compute units (streaming multiprocessors)
    pub compute_units: u32,
    /// Maximum power draw in watts
    pub max_power_watts: u64,
    /// Interconnect bandwidth in GB/s
    pub interconnect_gbps: u64,
}

impl DeviceCapacity {
    /// The pool's reference high-memory accelerator
    pub fn standard() -> Self {
        Self {
            memory_bytes: 183 * GB,
            compute_units: 148,
            max_power_watts: 900,
            interconnect_gbps: 1800,
        }
    }

    /// The three reservable dimensions of this capacity
    pub fn as_share(&self) -> ResourceShare {
        ResourceShare::new(
            self.memory_bytes,
            self.max_power_watts,
            self.interconnect_gbps,
        )
    }
}

impl Default for DeviceCapacity {
    fn default() -> Self {
        Self::standard()
    }
}

/// Point-in-time metrics reported for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Overall utilization percentage (0-100)
    pub utilization_pct: f32,
    /// Memory in use, bytes
    pub memory_used_bytes: u64,
    /// Memory visible to the driver, bytes
    pub memory_total_bytes: u64,
    /// Temperature in degrees Celsius
    pub temperature_c: f32,
    /// Current power draw in watts
    pub power_draw_watts: f32,
    /// Tensor/compute unit utilization percentage
    pub compute_utilization_pct: f32,
    /// Interconnect utilization percentage
    pub interconnect_utilization_pct: f32,
}

impl MetricsSnapshot {
    /// An idle device with nothing resident
    pub fn idle(memory_total_bytes: u64) -> Self {
        Self {
            utilization_pct: 0.0,
            memory_used_bytes: 0,
            memory_total_bytes,
            temperature_c: 0.0,
            power_draw_watts: 0.0,
            compute_utilization_pct: 0.0,
            interconnect_utilization_pct: 0.0,
        }
    }

    pub fn memory_usage_pct(&self) -> f32 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        (self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0) as f32
    }
}

/// A metrics snapshot plus the time it was captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub metrics: MetricsSnapshot,
    pub captured_at: DateTime<Utc>,
}

impl TelemetryReading {
    pub fn new(metrics: MetricsSnapshot, captured_at: DateTime<Utc>) -> Self {
        Self {
            metrics,
            captured_at,
        }
    }

    /// Age of the reading relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.captured_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

/// Read-only view of a registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub device_id: DeviceId,
    pub capacity: DeviceCapacity,
    /// Capacity committed by live reservations
    pub committed: ResourceShare,
    /// Number of live reservations touching this device
    pub reservations: usize,
    pub last_telemetry: Option<TelemetryReading>,
}

impl DeviceView {
    /// Capacity not yet committed to any reservation
    pub fn free(&self) -> ResourceShare {
        self.capacity.as_share().saturating_sub(self.committed)
    }

    pub fn is_idle(&self) -> bool {
        self.reservations == 0
    }
}
