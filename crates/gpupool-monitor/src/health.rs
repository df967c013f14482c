//! Threshold checks over device telemetry

use gpupool_core::{DeviceId, HealthThresholds, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// The metric that crossed a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Memory,
    Temperature,
    Utilization,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::Memory => write!(f, "memory"),
            AlertKind::Temperature => write!(f, "temperature"),
            AlertKind::Utilization => write!(f, "utilization"),
        }
    }
}

/// One threshold breach on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub device_id: DeviceId,
    pub level: AlertLevel,
    pub kind: AlertKind,
    /// Observed value (percent or degrees Celsius)
    pub value: f32,
    /// Threshold the value crossed
    pub threshold: f32,
}

fn graded(
    device_id: DeviceId,
    kind: AlertKind,
    value: f32,
    warning: f32,
    critical: f32,
) -> Option<HealthAlert> {
    let (level, threshold) = if value > critical {
        (AlertLevel::Critical, critical)
    } else if value > warning {
        (AlertLevel::Warning, warning)
    } else {
        return None;
    };

    Some(HealthAlert {
        device_id,
        level,
        kind,
        value,
        threshold,
    })
}

/// Evaluate one snapshot against the thresholds
///
/// Memory and temperature are graded (at most one alert each, critical
/// taking precedence). Utilization only ever warns.
pub fn evaluate(
    device_id: DeviceId,
    metrics: &MetricsSnapshot,
    thresholds: &HealthThresholds,
) -> Vec<HealthAlert> {
    let mut alerts = Vec::new();

    alerts.extend(graded(
        device_id,
        AlertKind::Memory,
        metrics.memory_usage_pct(),
        thresholds.memory_warning_pct,
        thresholds.memory_critical_pct,
    ));
    alerts.extend(graded(
        device_id,
        AlertKind::Temperature,
        metrics.temperature_c,
        thresholds.temperature_warning_c,
        thresholds.temperature_critical_c,
    ));

    if metrics.utilization_pct > thresholds.utilization_warning_pct {
        alerts.push(HealthAlert {
            device_id,
            level: AlertLevel::Warning,
            kind: AlertKind::Utilization,
            value: metrics.utilization_pct,
            threshold: thresholds.utilization_warning_pct,
        });
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(memory_used: u64, temperature: f32, utilization: f32) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::idle(100);
        snap.memory_used_bytes = memory_used;
        snap.temperature_c = temperature;
        snap.utilization_pct = utilization;
        snap
    }

    #[test]
    fn test_healthy_device_has_no_alerts() {
        let alerts = evaluate(0, &snapshot(50, 60.0, 70.0), &HealthThresholds::default());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_critical_takes_precedence() {
        let alerts = evaluate(3, &snapshot(97, 82.0, 10.0), &HealthThresholds::default());
        assert_eq!(alerts.len(), 2);

        assert_eq!(alerts[0].kind, AlertKind::Memory);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].threshold, 95.0);

        assert_eq!(alerts[1].kind, AlertKind::Temperature);
        assert_eq!(alerts[1].level, AlertLevel::Warning);
        assert_eq!(alerts[1].device_id, 3);
    }

    #[test]
    fn test_utilization_warning() {
        let alerts = evaluate(1, &snapshot(0, 30.0, 99.5), &HealthThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Utilization);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let alerts = evaluate(0, &snapshot(90, 80.0, 98.0), &HealthThresholds::default());
        assert!(alerts.is_empty());
    }
}
