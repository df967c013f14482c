//! gpupool-scheduler: capacity bookkeeping and placement for gpupool
//!
//! This crate provides the allocation engine proper:
//! - Device registry with per-device static capacity and telemetry
//! - Allocation ledger enforcing the per-device capacity invariant
//! - Placement planning over free capacity
//! - Cluster handle orchestrating plan, reserve and confirm
//! - Topology changes: expand, shrink and migrate

pub mod cluster;
pub mod dispatch;
pub mod ledger;
pub mod placement;
pub mod registry;
mod topology;

pub use cluster::{Cluster, ClusterBuilder, Inventory};
pub use dispatch::{ImmediateDispatcher, WorkloadDispatcher};
pub use ledger::{AllocationLedger, ReservationTerms};
pub use placement::{Candidate, LeastLoadedFirst, LowestIndexFirst, PlacementStrategy, Planner};
pub use registry::{DeviceRegistry, TelemetryBoard};
