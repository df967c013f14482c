//! gpupool-monitor: Telemetry collection for gpupool
//!
//! This crate provides:
//! - The `TelemetryProvider` boundary and its HTTP, static and null implementations
//! - Health threshold evaluation
//! - The periodic monitoring loop and its event stream

pub mod health;
pub mod monitor;
pub mod telemetry;

pub use health::{evaluate, AlertKind, AlertLevel, HealthAlert};
pub use monitor::{Auditor, Monitor, MonitorEvent, MonitorState};
pub use telemetry::{
    HttpTelemetryProvider, NullTelemetryProvider, StaticTelemetryProvider, TelemetryProvider,
};
