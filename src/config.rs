//! Feed configuration
//!
//! One serde tree, loaded from TOML with every field defaulted, then
//! patched from `NEPSE_FEED_*` environment variables. `validate()` runs
//! before anything is constructed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::health::{HealthThresholds, MonitorConfig};
use crate::scheduler::SchedulerConfig;
use crate::scrapers::SourceConfig;
use crate::session::SessionHours;
use crate::validation::ValidationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// HTTP listen address for the observability endpoints
    pub bind: String,
    /// Trading-day override database; in-memory when unset
    pub database_path: Option<PathBuf>,
    /// Watchlist passed to every fetch; empty means the full market
    pub symbols: Vec<String>,
    pub session: SessionHours,
    pub scheduler: SchedulerConfig,
    pub health: HealthThresholds,
    pub monitor: MonitorConfig,
    pub validation: ValidationConfig,
    /// Priority order: primary first
    pub sources: Vec<SourceConfig>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            database_path: None,
            symbols: Vec::new(),
            session: SessionHours::default(),
            scheduler: SchedulerConfig::default(),
            health: HealthThresholds::default(),
            monitor: MonitorConfig::default(),
            validation: ValidationConfig::default(),
            sources: SourceConfig::defaults(),
        }
    }
}

impl FeedConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as `apply_env_overrides`, reading from `lookup` instead of the process env
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NEPSE_FEED_BIND") {
            self.bind = v;
        }
        if let Some(v) = lookup("NEPSE_FEED_DATABASE") {
            if !v.is_empty() {
                self.database_path = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = lookup("NEPSE_FEED_SYMBOLS") {
            self.symbols = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("NEPSE_FEED_EXTENDED_HOURS") {
            match v.parse() {
                Ok(b) => self.session.extended_hours = b,
                Err(_) => warn!(value = %v, "ignoring NEPSE_FEED_EXTENDED_HOURS"),
            }
        }
        if let Some(v) = lookup("NEPSE_FEED_DEGRADED_THRESHOLD") {
            match v.parse() {
                Ok(d) => self.health.degraded_threshold = d,
                Err(_) => warn!(value = %v, "ignoring NEPSE_FEED_DEGRADED_THRESHOLD"),
            }
        }

        let millis = |key: &str| -> Option<Duration> {
            let v = lookup(key)?;
            match v.parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    warn!(key, value = %v, "ignoring non-numeric duration override");
                    None
                }
            }
        };
        if let Some(d) = millis("NEPSE_FEED_ACTIVE_INTERVAL_MS") {
            self.scheduler.active_interval = d;
        }
        if let Some(d) = millis("NEPSE_FEED_PASSIVE_INTERVAL_MS") {
            self.scheduler.passive_interval = d;
        }
        if let Some(d) = millis("NEPSE_FEED_STALENESS_MS") {
            self.scheduler.staleness_threshold = d;
        }
        if let Some(d) = millis("NEPSE_FEED_SUPPRESSION_WINDOW_MS") {
            self.monitor.alerts.suppression_window = d;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        self.scheduler.validate()?;
        self.health.validate()?;
        self.monitor.validate()?;
        self.validation.validate()?;

        if self.sources.is_empty() {
            return Err(ConfigError::invalid("sources", "at least one source is required"));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            let name = source.name();
            if name.trim().is_empty() {
                return Err(ConfigError::invalid("sources.name", "must not be empty"));
            }
            if !seen.insert(name) {
                return Err(ConfigError::invalid(
                    "sources.name",
                    format!("duplicate source {name}"),
                ));
            }
            if source.rate_limit().min_interval.is_zero() {
                return Err(ConfigError::invalid(
                    "sources.rate_limit.min_interval",
                    format!("{name}: must be non-zero"),
                ));
            }
            if source.retry().max_attempts == 0 {
                return Err(ConfigError::invalid(
                    "sources.retry.max_attempts",
                    format!("{name}: must be at least 1"),
                ));
            }
        }
        Ok(())
    }
}

/// Durations as integer milliseconds
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let cfg = FeedConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.sources.len(), 3);
        assert_eq!(cfg.health.degraded_threshold, 3);
        assert_eq!(cfg.monitor.alerts.suppression_window, Duration::from_secs(600));
        assert_eq!(cfg.scheduler.active_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = FeedConfig::from_toml_str(
            r#"
            symbols = ["NABIL"]

            [scheduler]
            active_interval = 10000

            [health]
            degraded_threshold = 5

            [monitor.alerts]
            suppression_window = 60000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.active_interval, Duration::from_secs(10));
        assert_eq!(cfg.scheduler.passive_interval, Duration::from_secs(300));
        assert_eq!(cfg.health.degraded_threshold, 5);
        assert_eq!(cfg.monitor.alerts.suppression_window, Duration::from_secs(60));
        assert_eq!(cfg.session.open_hour, 11);
        assert_eq!(cfg.sources.len(), 3);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("NEPSE_FEED_BIND", "127.0.0.1:9000"),
            ("NEPSE_FEED_SYMBOLS", "nabil, nica,,"),
            ("NEPSE_FEED_STALENESS_MS", "90000"),
            ("NEPSE_FEED_DEGRADED_THRESHOLD", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut cfg = FeedConfig::default();
        cfg.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.symbols, vec!["NABIL", "NICA"]);
        assert_eq!(cfg.scheduler.staleness_threshold, Duration::from_secs(90));
        assert_eq!(cfg.health.degraded_threshold, 3);
    }

    #[test]
    fn test_validation_failures() {
        let mut cfg = FeedConfig::default();
        cfg.sources.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { ref field, .. }) if field == "sources"));

        let mut cfg = FeedConfig::default();
        cfg.session.close_hour = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = FeedConfig::default();
        cfg.scheduler.active_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = FeedConfig::default();
        let dup = cfg.sources[0].clone();
        cfg.sources.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = FeedConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
