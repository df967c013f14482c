//! Allocation requests, reservations and handles

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::device::DeviceId;
use crate::error::{PoolError, PoolResult};
use crate::resources::ResourceShare;

/// Globally unique, never reused allocation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(Uuid);

impl AllocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AllocationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for AllocationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Reservation lifecycle
///
/// `Pending -> Active -> Completed`, or `Pending -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// Capacity held, waiting for external confirmation
    Pending,
    /// Recorded and holding capacity
    Active,
    /// Released by its owner
    Completed,
    /// Placement or confirmation failed; holds no capacity
    Failed,
}

impl AllocationStatus {
    /// Whether a reservation in this state holds capacity
    pub fn is_live(&self) -> bool {
        matches!(self, AllocationStatus::Pending | AllocationStatus::Active)
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationStatus::Pending => write!(f, "Pending"),
            AllocationStatus::Active => write!(f, "Active"),
            AllocationStatus::Completed => write!(f, "Completed"),
            AllocationStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Requester-supplied priority; recorded but never used for preemption
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// How the resource amounts in a request are to be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DemandAccounting {
    /// Amounts are what each device must provide
    #[default]
    PerDevice,
    /// Amounts are a total, split evenly across the requested devices
    Total,
}

/// Allocation request submitted by a client component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Requesting component, informational only
    pub owner: String,
    /// Number of devices required
    pub device_count: u32,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub power_watts: u64,
    #[serde(default)]
    pub bandwidth_gbps: u64,
    #[serde(default)]
    pub accounting: DemandAccounting,
    #[serde(default)]
    pub priority: Priority,
    /// Scheduling hint used to derive `estimated_completion`
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    /// Devices that must not be selected
    #[serde(default)]
    pub exclude: Vec<DeviceId>,
}

impl AllocationRequest {
    /// Create a per-device request with no resource demand
    pub fn new(owner: impl Into<String>, device_count: u32) -> Self {
        Self {
            owner: owner.into(),
            device_count,
            memory_bytes: 0,
            power_watts: 0,
            bandwidth_gbps: 0,
            accounting: DemandAccounting::PerDevice,
            priority: Priority::Normal,
            estimated_duration_secs: None,
            exclude: Vec::new(),
        }
    }

    pub fn with_demand(mut self, memory_bytes: u64, power_watts: u64, bandwidth_gbps: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self.power_watts = power_watts;
        self.bandwidth_gbps = bandwidth_gbps;
        self
    }

    pub fn with_accounting(mut self, accounting: DemandAccounting) -> Self {
        self.accounting = accounting;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn excluding(mut self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.exclude.extend(devices);
        self
    }

    /// What each selected device must provide
    pub fn per_device_share(&self) -> ResourceShare {
        let demand = ResourceShare::new(self.memory_bytes, self.power_watts, self.bandwidth_gbps);
        match self.accounting {
            DemandAccounting::PerDevice => demand,
            DemandAccounting::Total => demand.split_even(u64::from(self.device_count)),
        }
    }

    /// Convert into the planner's view of the request
    pub fn placement(&self) -> PoolResult<PlacementRequest> {
        if self.device_count == 0 {
            return Err(PoolError::InvalidRequest(
                "device_count must be at least 1".to_string(),
            ));
        }
        Ok(PlacementRequest {
            device_count: self.device_count,
            per_device: self.per_device_share(),
            exclude: self.exclude.iter().copied().collect(),
        })
    }
}

/// Input to the placement planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub device_count: u32,
    pub per_device: ResourceShare,
    #[serde(default)]
    pub exclude: BTreeSet<DeviceId>,
}

impl PlacementRequest {
    pub fn new(device_count: u32, per_device: ResourceShare) -> Self {
        Self {
            device_count,
            per_device,
            exclude: BTreeSet::new(),
        }
    }
}

/// A claim against one or more devices' capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub allocation_id: AllocationId,
    pub owner: String,
    /// Claimed devices, ascending
    pub device_ids: Vec<DeviceId>,
    /// Amount claimed on each device in `device_ids`
    pub per_device: ResourceShare,
    pub status: AllocationStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Informational scheduling hint, never enforced
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Why the reservation ended up `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Number of times this reservation has been migrated
    #[serde(default)]
    pub migrations: u32,
}

impl Reservation {
    pub fn new(
        owner: String,
        device_ids: Vec<DeviceId>,
        per_device: ResourceShare,
        status: AllocationStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            allocation_id: AllocationId::new(),
            owner,
            device_ids,
            per_device,
            status,
            priority: Priority::Normal,
            created_at: now,
            updated_at: now,
            estimated_completion: None,
            failure_reason: None,
            migrations: 0,
        }
    }

    pub fn with_estimate(mut self, duration_secs: Option<u64>) -> Self {
        self.estimated_completion = duration_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| self.created_at + Duration::seconds(secs));
        self
    }

    /// Total claimed across all devices
    pub fn total(&self) -> ResourceShare {
        self.per_device.saturating_mul(self.device_ids.len() as u64)
    }

    pub fn memory_reserved_bytes(&self) -> u64 {
        self.total().memory_bytes
    }

    pub fn power_reserved_watts(&self) -> u64 {
        self.total().power_watts
    }

    pub fn bandwidth_reserved_gbps(&self) -> u64 {
        self.total().bandwidth_gbps
    }

    pub fn touches(&self, device_id: DeviceId) -> bool {
        self.device_ids.contains(&device_id)
    }
}

/// Returned to callers on a successful allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationHandle {
    pub allocation_id: AllocationId,
    pub device_ids: Vec<DeviceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_accounting_splits_evenly() {
        let req = AllocationRequest::new("tts", 4)
            .with_demand(180, 100, 8)
            .with_accounting(DemandAccounting::Total);
        assert_eq!(req.per_device_share(), ResourceShare::new(45, 25, 2));
    }

    #[test]
    fn test_per_device_accounting_is_verbatim() {
        let req = AllocationRequest::new("llm", 2).with_demand(45, 10, 1);
        assert_eq!(req.per_device_share(), ResourceShare::new(45, 10, 1));
    }

    #[test]
    fn test_zero_device_request_rejected() {
        let req = AllocationRequest::new("analytics", 0);
        assert!(matches!(req.placement(), Err(PoolError::InvalidRequest(_))));
    }

    #[test]
    fn test_reservation_totals() {
        let r = Reservation::new(
            "llm".to_string(),
            vec![0, 1, 2],
            ResourceShare::new(10, 2, 1),
            AllocationStatus::Active,
        );
        assert_eq!(r.memory_reserved_bytes(), 30);
        assert_eq!(r.power_reserved_watts(), 6);
        assert!(r.touches(2));
        assert!(!r.touches(3));
    }

    #[test]
    fn test_estimated_completion() {
        let r = Reservation::new(
            "llm".to_string(),
            vec![0],
            ResourceShare::ZERO,
            AllocationStatus::Active,
        )
        .with_estimate(Some(60));
        assert_eq!(
            r.estimated_completion,
            Some(r.created_at + Duration::seconds(60))
        );
    }

    #[test]
    fn test_allocation_id_parse() {
        let id = AllocationId::new();
        let parsed: AllocationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_status_liveness() {
        assert!(AllocationStatus::Pending.is_live());
        assert!(AllocationStatus::Active.is_live());
        assert!(!AllocationStatus::Completed.is_live());
        assert!(!AllocationStatus::Failed.is_live());
    }
}
