//! Error types for gpupool

use thiserror::Error;

use crate::allocation::AllocationId;
use crate::device::DeviceId;
use crate::resources::Resource;

/// Main error type for gpupool
#[derive(Error, Debug)]
pub enum PoolError {
    /// The per-device demand does not fit even an empty device
    #[error("Request exceeds device capacity: {resource} needs {requested} per device, largest device has {capacity}")]
    RequestExceedsDeviceCapacity {
        resource: Resource,
        requested: u64,
        capacity: u64,
    },

    /// Not enough devices with free capacity right now
    #[error("Insufficient capacity: requested {requested} devices, {available} available")]
    InsufficientCapacity { requested: u32, available: u32 },

    /// A device targeted by `reserve` no longer has room
    #[error("Capacity exceeded on device {device_id}: {resource}")]
    CapacityExceeded {
        device_id: DeviceId,
        resource: Resource,
    },

    /// Unknown or already released allocation
    #[error("Allocation not found: {0}")]
    AllocationNotFound(AllocationId),

    /// Unknown device
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Device removal blocked by live reservations
    #[error("Device {device_id} still hosts {reservations} reservation(s)")]
    DeviceNotEmpty {
        device_id: DeviceId,
        reservations: usize,
    },

    /// Shrink candidates still host live reservations
    #[error("Shrink would remove devices with active reservations: {device_ids:?}")]
    WouldRemoveActiveReservations { device_ids: Vec<DeviceId> },

    /// Shrink would leave the cluster empty
    #[error("Cannot remove {requested} of {present} devices; at least one must remain")]
    InsufficientDevices { requested: u32, present: u32 },

    /// Registration would pass the configured cluster size ceiling
    #[error("Cluster size limit reached: at most {max} devices")]
    ClusterSizeLimit { max: usize },

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// External confirmation of a pending reservation failed
    #[error("Confirmation failed for {allocation_id}: {reason}")]
    Confirmation {
        allocation_id: AllocationId,
        reason: String,
    },

    /// Ledger bookkeeping no longer satisfies the capacity invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PoolError {
    /// Whether retrying the same call later can succeed without changing it
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::InsufficientCapacity { .. }
                | PoolError::CapacityExceeded { .. }
                | PoolError::DeviceNotEmpty { .. }
                | PoolError::WouldRemoveActiveReservations { .. }
                | PoolError::Confirmation { .. }
        )
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::RequestExceedsDeviceCapacity { .. } => "request_exceeds_device_capacity",
            PoolError::InsufficientCapacity { .. } => "insufficient_capacity",
            PoolError::CapacityExceeded { .. } => "capacity_exceeded",
            PoolError::AllocationNotFound(_) => "allocation_not_found",
            PoolError::DeviceNotFound(_) => "device_not_found",
            PoolError::DeviceNotEmpty { .. } => "device_not_empty",
            PoolError::WouldRemoveActiveReservations { .. } => "would_remove_active_reservations",
            PoolError::InsufficientDevices { .. } => "insufficient_devices",
            PoolError::ClusterSizeLimit { .. } => "cluster_size_limit",
            PoolError::InvalidRequest(_) => "invalid_request",
            PoolError::Confirmation { .. } => "confirmation_failed",
            PoolError::InvariantViolation(_) => "invariant_violation",
            PoolError::Config(_) => "config",
            PoolError::Io(_) => "io",
            PoolError::Serialization(_) => "serialization",
        }
    }
}

/// Result type for gpupool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PoolError {
    fn from(err: toml::de::Error) -> Self {
        PoolError::Config(err.to_string())
    }
}

/// Failure to obtain a metrics snapshot for a single device
///
/// Local to one monitoring tick; never surfaced to allocation callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Telemetry timed out after {0} ms")]
    Timeout(u64),

    #[error("Telemetry unavailable: {0}")]
    Unavailable(String),

    #[error("Telemetry transport error: {0}")]
    Transport(String),

    #[error("Malformed telemetry: {0}")]
    Malformed(String),
}
