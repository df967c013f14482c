//! gpupool-core: Core types for the gpupool allocation engine
//!
//! This crate provides the types shared by every other gpupool crate:
//! - Device capacity and telemetry readings
//! - Resource shares, allocation requests and reservations
//! - Cluster-wide metrics
//! - Configuration types
//! - Error handling

pub mod allocation;
pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod resources;

pub use allocation::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use metrics::*;
pub use resources::*;
