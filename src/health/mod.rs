//! Health tracking: per-source records, component monitor, alerting

pub mod alerts;
pub mod monitor;
pub mod source;

use serde::{Deserialize, Serialize};

pub use alerts::{Alert, AlertConfig, AlertError, AlertManager, AlertSeverity};
pub use monitor::{
    ComponentHealth, ComponentProbe, HealthCheckResult, HealthEvent, HealthEventKind, HealthMonitor,
    HealthReporter, MonitorConfig, MonitorError, SystemMetrics,
};
pub use source::{HealthThresholds, Outcome, SourceHealth, SourceHealthRecord, SourceProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
