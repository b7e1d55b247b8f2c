//! Alert lifecycle: raise with suppression, acknowledge, resolve.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::duration_serde;
use crate::session::{SystemClock, WallClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Info,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub component: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    /// Repeat alerts for the same component and severity inside this window are dropped
    #[serde(with = "duration_serde")]
    pub suppression_window: Duration,
    pub history_capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppression_window: Duration::from_secs(10 * 60),
            history_capacity: 1000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Default)]
struct AlertState {
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    last_raised: HashMap<(String, AlertSeverity), DateTime<Utc>>,
    suppressed: u64,
}

impl AlertState {
    fn update_history(&mut self, alert: &Alert) {
        if let Some(entry) = self.history.iter_mut().rev().find(|a| a.id == alert.id) {
            *entry = alert.clone();
        }
    }
}

pub struct AlertManager {
    config: AlertConfig,
    clock: Arc<dyn WallClock>,
    state: RwLock<AlertState>,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AlertConfig, clock: Arc<dyn WallClock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(AlertState::default()),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Create an alert unless an identical one is still open or was raised
    /// inside the suppression window. Returns the new alert.
    pub fn raise(
        &self,
        component: &str,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Option<Alert> {
        if !self.config.enabled {
            return None;
        }

        let now = self.clock.now();
        let window = chrono::Duration::from_std(self.config.suppression_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let key = (component.to_string(), severity);

        let mut state = self.state.write();
        let recently_raised = state
            .last_raised
            .get(&key)
            .is_some_and(|at| now - *at < window);
        let still_open = state
            .active
            .values()
            .any(|a| a.component == component && a.severity == severity && !a.resolved);
        if recently_raised || still_open {
            state.suppressed += 1;
            drop(state);
            debug!(component, %severity, "alert suppressed");
            return None;
        }

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            component: component.to_string(),
            severity,
            message: message.into(),
            timestamp: now,
            acknowledged: false,
            resolved: false,
            resolved_at: None,
        };

        state.last_raised.insert(key, now);
        state.active.insert(alert.id.clone(), alert.clone());
        while state.history.len() >= self.config.history_capacity.max(1) {
            state.history.pop_front();
        }
        state.history.push_back(alert.clone());
        drop(state);

        warn!(
            alert_id = %alert.id,
            component,
            %severity,
            message = %alert.message,
            "health alert raised"
        );
        Some(alert)
    }

    /// Marks acknowledged; the alert stays active until its component recovers
    pub fn acknowledge(&self, id: &str) -> Result<Alert, AlertError> {
        let mut state = self.state.write();
        let alert = state
            .active
            .get_mut(id)
            .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
        alert.acknowledged = true;
        let alert = alert.clone();
        state.update_history(&alert);
        drop(state);

        info!(alert_id = id, "alert acknowledged");
        Ok(alert)
    }

    /// Resolve every open alert of `component`
    pub fn resolve_component(&self, component: &str) -> Vec<Alert> {
        let now = self.clock.now();
        let mut state = self.state.write();

        let ids: Vec<String> = state
            .active
            .values()
            .filter(|a| a.component == component)
            .map(|a| a.id.clone())
            .collect();

        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut alert) = state.active.remove(&id) {
                alert.resolved = true;
                alert.resolved_at = Some(now);
                state.update_history(&alert);
                resolved.push(alert);
            }
        }
        drop(state);

        for alert in &resolved {
            info!(alert_id = %alert.id, component, "alert resolved");
        }
        resolved
    }

    /// Unresolved alerts, oldest first
    pub fn active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.state.read().active.values().cloned().collect();
        alerts.sort_by_key(|a| a.timestamp);
        alerts
    }

    pub fn active_count(&self) -> usize {
        self.state.read().active.len()
    }

    pub fn history(&self) -> Vec<Alert> {
        self.state.read().history.iter().cloned().collect()
    }

    pub fn suppressed_count(&self) -> u64 {
        self.state.read().suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManualClock;
    use chrono::TimeZone;

    fn manager(window_secs: u64) -> (AlertManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 13, 6, 0, 0).unwrap(),
        ));
        let mgr = AlertManager::with_clock(
            AlertConfig {
                suppression_window: Duration::from_secs(window_secs),
                ..Default::default()
            },
            clock.clone(),
        );
        (mgr, clock)
    }

    #[test]
    fn test_repeat_within_window_suppressed() {
        let (mgr, clock) = manager(600);
        assert!(mgr.raise("nepse-web", AlertSeverity::Critical, "down").is_some());

        // recovered and failed again a minute later
        mgr.resolve_component("nepse-web");
        clock.advance(chrono::Duration::seconds(60));
        assert!(mgr.raise("nepse-web", AlertSeverity::Critical, "down").is_none());

        assert_eq!(mgr.history().len(), 1);
        assert_eq!(mgr.suppressed_count(), 1);
    }

    #[test]
    fn test_raise_again_after_window() {
        let (mgr, clock) = manager(600);
        mgr.raise("nepse-web", AlertSeverity::Critical, "down");
        mgr.resolve_component("nepse-web");
        clock.advance(chrono::Duration::seconds(601));
        assert!(mgr.raise("nepse-web", AlertSeverity::Critical, "down").is_some());
        assert_eq!(mgr.history().len(), 2);
    }

    #[test]
    fn test_other_component_not_suppressed() {
        let (mgr, _) = manager(600);
        assert!(mgr.raise("a", AlertSeverity::Critical, "down").is_some());
        assert!(mgr.raise("b", AlertSeverity::Critical, "down").is_some());
        assert!(mgr.raise("a", AlertSeverity::Warning, "slow").is_some());
        assert_eq!(mgr.active_count(), 3);
    }

    #[test]
    fn test_acknowledge_does_not_resolve() {
        let (mgr, _) = manager(600);
        let alert = mgr.raise("a", AlertSeverity::Critical, "down").unwrap();

        let acked = mgr.acknowledge(&alert.id).unwrap();
        assert!(acked.acknowledged);
        assert!(!acked.resolved);
        assert_eq!(mgr.active().len(), 1);
        assert!(mgr.history()[0].acknowledged);

        assert_eq!(
            mgr.acknowledge("missing"),
            Err(AlertError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn test_resolve_stamps_resolved_at() {
        let (mgr, clock) = manager(600);
        mgr.raise("a", AlertSeverity::Critical, "down");
        clock.advance(chrono::Duration::seconds(30));

        let resolved = mgr.resolve_component("a");
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].resolved);
        assert_eq!(resolved[0].resolved_at, Some(clock.now()));
        assert!(mgr.active().is_empty());
        assert!(mgr.history()[0].resolved);
    }

    #[test]
    fn test_history_is_bounded() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mgr = AlertManager::with_clock(
            AlertConfig {
                suppression_window: Duration::ZERO,
                history_capacity: 3,
                ..Default::default()
            },
            clock,
        );
        for i in 0..5 {
            mgr.raise(&format!("c{i}"), AlertSeverity::Info, "x");
        }
        let history = mgr.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].component, "c2");
    }

    #[test]
    fn test_disabled_manager_raises_nothing() {
        let mgr = AlertManager::new(AlertConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(mgr.raise("a", AlertSeverity::Critical, "down").is_none());
    }
}
