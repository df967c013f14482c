//! Configuration types for gpupool

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::device::DeviceCapacity;
use crate::error::{PoolError, PoolResult};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Device pool configuration
    pub pool: PoolConfig,
    /// Monitoring loop configuration
    pub monitor: MonitorConfig,
    /// Health alert thresholds
    pub health: HealthThresholds,
    /// Telemetry source configuration
    pub telemetry: TelemetryConfig,
    /// Allocation orchestration settings
    pub allocation: AllocationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("Failed to read config file: {}", e)))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| PoolError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> PoolResult<()> {
        if self.pool.initial_devices == 0 {
            return Err(PoolError::Config(
                "pool.initial_devices must be at least 1".to_string(),
            ));
        }
        if let Some(max) = self.pool.max_devices {
            if self.pool.initial_devices > max {
                return Err(PoolError::Config(format!(
                    "pool.initial_devices ({}) exceeds pool.max_devices ({})",
                    self.pool.initial_devices, max
                )));
            }
        }
        if self.monitor.interval_ms == 0 {
            return Err(PoolError::Config(
                "monitor.interval_ms must be positive".to_string(),
            ));
        }
        if self.monitor.telemetry_timeout_ms == 0 {
            return Err(PoolError::Config(
                "monitor.telemetry_timeout_ms must be positive".to_string(),
            ));
        }
        if self.allocation.confirm_timeout_ms == 0 {
            return Err(PoolError::Config(
                "allocation.confirm_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9190,
        }
    }
}

/// Device pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Devices registered at startup
    pub initial_devices: usize,
    /// Static capacity given to devices added by startup and `expand`
    pub device_capacity: DeviceCapacity,
    /// Hard ceiling on cluster size (none by default)
    pub max_devices: Option<usize>,
    /// Completed/failed reservation records retained for lookups
    pub finished_history: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_devices: 8,
            device_capacity: DeviceCapacity::standard(),
            max_devices: None,
            finished_history: 1024,
        }
    }
}

/// Monitoring loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Tick interval in milliseconds
    pub interval_ms: u64,
    /// Per-device telemetry call timeout in milliseconds
    pub telemetry_timeout_ms: u64,
    /// Age after which a reading no longer counts as reporting
    pub staleness_ms: u64,
    /// Capacity of the event broadcast buffer
    pub event_buffer: usize,
    /// Re-verify the capacity invariant after every tick
    pub audit: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            telemetry_timeout_ms: 300,
            staleness_ms: 15000,
            event_buffer: 256,
            audit: true,
        }
    }
}

/// Thresholds for device health alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub memory_warning_pct: f32,
    pub memory_critical_pct: f32,
    pub temperature_warning_c: f32,
    pub temperature_critical_c: f32,
    pub utilization_warning_pct: f32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            memory_warning_pct: 90.0,
            memory_critical_pct: 95.0,
            temperature_warning_c: 80.0,
            temperature_critical_c: 85.0,
            utilization_warning_pct: 98.0,
        }
    }
}

/// Telemetry source configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Base URL of the metrics service; no provider when unset
    pub endpoint: Option<String>,
}

/// Device ordering used when several sets of devices could host a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementPolicy {
    /// Ascending device id
    #[default]
    LowestIndexFirst,
    /// Most free memory first, ties by ascending id
    LeastLoadedFirst,
}

/// Allocation orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Bound on the external confirmation step, milliseconds
    pub confirm_timeout_ms: u64,
    /// Re-plan attempts when a plan goes stale before commit
    pub plan_retries: u32,
    pub strategy: PlacementPolicy,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: 2000,
            plan_retries: 3,
            strategy: PlacementPolicy::LowestIndexFirst,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert_eq!(config.api.port, 9190);
        assert_eq!(config.pool.initial_devices, 8);
        assert_eq!(config.monitor.interval_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_parse() {
        let toml_str = r#"
[pool]
initial_devices = 4
max_devices = 16

[pool.device_capacity]
memory_bytes = 80000000000
compute_units = 132
max_power_watts = 700
interconnect_gbps = 900

[monitor]
interval_ms = 1000
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pool.initial_devices, 4);
        assert_eq!(config.pool.max_devices, Some(16));
        assert_eq!(config.pool.device_capacity.compute_units, 132);
        assert_eq!(config.monitor.interval_ms, 1000);
        assert_eq!(config.monitor.telemetry_timeout_ms, 300);
        assert_eq!(config.api.port, 9190);
    }

    #[test]
    fn test_placement_strategy_parse() {
        let config: EngineConfig = toml::from_str(
            r#"
[allocation]
strategy = "least-loaded-first"
"#,
        )
        .unwrap();
        assert_eq!(config.allocation.strategy, PlacementPolicy::LeastLoadedFirst);
        assert_eq!(config.allocation.plan_retries, 3);
        assert_eq!(
            EngineConfig::default().allocation.strategy,
            PlacementPolicy::LowestIndexFirst
        );
    }

    #[test]
    fn test_validate_rejects_ceiling_below_initial() {
        let mut config = EngineConfig::default();
        config.pool.max_devices = Some(4);
        assert!(matches!(config.validate(), Err(PoolError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = EngineConfig::default();
        config.monitor.interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
