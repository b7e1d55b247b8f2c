//! Health Monitor
//!
//! Aggregates registered components into a system-wide view:
//! - Probe loop: runs every component probe under a timeout, records the
//!   result, raises/resolves alerts on status transitions, and drains
//!   events pushed by components through `HealthReporter`
//! - Metrics loop: rolls component state into `SystemMetrics`
//!
//! Every read API returns an owned copy.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alerts::{Alert, AlertConfig, AlertError, AlertManager, AlertSeverity};
use super::HealthStatus;
use crate::config::{duration_serde, ConfigError};
use crate::session::{SystemClock, WallClock};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_serde")]
    pub probe_interval: Duration,
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
    pub history_capacity: usize,
    /// Sources with no fetch outcome for this long get a direct reachability check
    #[serde(with = "duration_serde")]
    pub idle_probe_after: Duration,
    pub alerts: AlertConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(5),
            history_capacity: 100,
            idle_probe_after: Duration::from_secs(5 * 60),
            alerts: AlertConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, d) in [
            ("monitor.probe_interval", self.probe_interval),
            ("monitor.metrics_interval", self.metrics_interval),
            ("monitor.probe_timeout", self.probe_timeout),
            ("monitor.idle_probe_after", self.idle_probe_after),
        ] {
            if d.is_zero() {
                return Err(ConfigError::invalid(field, "must be non-zero"));
            }
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::invalid(
                "monitor.history_capacity",
                "must be at least 1",
            ));
        }
        if self.alerts.history_capacity == 0 {
            return Err(ConfigError::invalid(
                "monitor.alerts.history_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// PROBES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl HealthCheckResult {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            status,
            response_time_ms: 0,
            error: None,
            details: Map::new(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn failed(status: HealthStatus, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(status)
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait ComponentProbe: Send + Sync {
    fn component_name(&self) -> &str;

    async fn probe(&self, cancel: &CancellationToken) -> HealthCheckResult;
}

/// What a pushed event asks the monitor to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEventKind {
    Alert(AlertSeverity),
    /// The reported condition cleared; open alerts for the component resolve
    Recovered,
}

/// Pushed by components that only need to report
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub component: String,
    pub kind: HealthEventKind,
    pub message: String,
}

impl HealthEvent {
    pub fn critical(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            kind: HealthEventKind::Alert(AlertSeverity::Critical),
            message: message.into(),
        }
    }

    pub fn warning(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            kind: HealthEventKind::Alert(AlertSeverity::Warning),
            message: message.into(),
        }
    }

    pub fn recovered(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            kind: HealthEventKind::Recovered,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: mpsc::UnboundedSender<HealthEvent>,
}

impl HealthReporter {
    pub fn report(&self, event: HealthEvent) {
        if self.tx.send(event).is_err() {
            debug!("health monitor gone, event dropped");
        }
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: u64,
    pub error_count: u64,
    /// Percentage of Healthy results in the retained history
    pub success_rate: f64,
    pub details: Map<String, Value>,
    pub history: Vec<HealthCheckResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub overall_status: HealthStatus,
    pub last_update: Option<DateTime<Utc>>,
    pub components_total: usize,
    pub components_healthy: usize,
    pub components_degraded: usize,
    pub components_unhealthy: usize,
    pub avg_response_time_ms: f64,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub error_rate: f64,
    pub active_alerts: usize,
    pub uptime_secs: u64,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            overall_status: HealthStatus::Unknown,
            last_update: None,
            components_total: 0,
            components_healthy: 0,
            components_degraded: 0,
            components_unhealthy: 0,
            avg_response_time_ms: 0.0,
            total_checks: 0,
            failed_checks: 0,
            error_rate: 0.0,
            active_alerts: 0,
            uptime_secs: 0,
        }
    }
}

/// Healthy with no unhealthy component, Degraded with a strict healthy
/// majority, Unhealthy otherwise. Unknown when nothing is registered.
pub fn overall_status(statuses: &[HealthStatus]) -> HealthStatus {
    if statuses.is_empty() {
        return HealthStatus::Unknown;
    }
    let unhealthy = statuses
        .iter()
        .filter(|s| **s == HealthStatus::Unhealthy)
        .count();
    let healthy = statuses
        .iter()
        .filter(|s| **s == HealthStatus::Healthy)
        .count();

    if unhealthy == 0 {
        HealthStatus::Healthy
    } else if healthy * 2 > statuses.len() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("health monitor already started")]
    AlreadyRunning,
}

// =============================================================================
// MONITOR
// =============================================================================

struct ComponentState {
    status: HealthStatus,
    last_check: Option<DateTime<Utc>>,
    response_time_ms: u64,
    error_count: u64,
    details: Map<String, Value>,
    history: VecDeque<HealthCheckResult>,
}

impl ComponentState {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            response_time_ms: 0,
            error_count: 0,
            details: Map::new(),
            history: VecDeque::new(),
        }
    }

    fn snapshot(&self, name: &str) -> ComponentHealth {
        let healthy = self
            .history
            .iter()
            .filter(|r| r.status == HealthStatus::Healthy)
            .count();
        let success_rate = if self.history.is_empty() {
            0.0
        } else {
            healthy as f64 / self.history.len() as f64 * 100.0
        };
        ComponentHealth {
            name: name.to_string(),
            status: self.status,
            last_check: self.last_check,
            response_time_ms: self.response_time_ms,
            error_count: self.error_count,
            success_rate,
            details: self.details.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }
}

struct Registered {
    probe: Arc<dyn ComponentProbe>,
    state: ComponentState,
}

pub struct HealthMonitor {
    config: MonitorConfig,
    clock: Arc<dyn WallClock>,
    started_at: Instant,
    components: RwLock<BTreeMap<String, Registered>>,
    metrics: RwLock<SystemMetrics>,
    alerts: AlertManager,
    events_tx: mpsc::UnboundedSender<HealthEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HealthEvent>>>,
    total_checks: AtomicU64,
    failed_checks: AtomicU64,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn WallClock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let alerts = AlertManager::with_clock(config.alerts.clone(), clock.clone());

        info!(
            probe_interval_ms = config.probe_interval.as_millis() as u64,
            metrics_interval_ms = config.metrics_interval.as_millis() as u64,
            "health monitor initialized"
        );

        Ok(Self {
            config,
            clock,
            started_at: Instant::now(),
            components: RwLock::new(BTreeMap::new()),
            metrics: RwLock::new(SystemMetrics::default()),
            alerts,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            total_checks: AtomicU64::new(0),
            failed_checks: AtomicU64::new(0),
        })
    }

    pub fn register(&self, probe: Arc<dyn ComponentProbe>) {
        let name = probe.component_name().to_string();
        let replaced = self
            .components
            .write()
            .insert(
                name.clone(),
                Registered {
                    probe,
                    state: ComponentState::new(),
                },
            )
            .is_some();
        if replaced {
            warn!(component = %name, "component re-registered, history reset");
        } else {
            info!(component = %name, "component registered for health monitoring");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.components.write().remove(name).is_some()
    }

    pub fn reporter(&self) -> HealthReporter {
        HealthReporter {
            tx: self.events_tx.clone(),
        }
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    async fn run_probe(&self, probe: Arc<dyn ComponentProbe>, cancel: &CancellationToken) -> HealthCheckResult {
        let started_at = self.clock.now();
        let start = Instant::now();
        let fut = AssertUnwindSafe(probe.probe(cancel)).catch_unwind();

        let mut result = match tokio::time::timeout(self.config.probe_timeout, fut).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!(component = probe.component_name(), "probe panicked");
                HealthCheckResult::failed(HealthStatus::Unhealthy, "probe panicked")
            }
            Err(_) => HealthCheckResult::failed(
                HealthStatus::Unhealthy,
                format!(
                    "probe timed out after {}ms",
                    self.config.probe_timeout.as_millis()
                ),
            ),
        };
        result.timestamp = started_at;
        result.response_time_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Probe one component now; `None` if it is not registered
    pub async fn check_component(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Option<HealthCheckResult> {
        let probe = self.components.read().get(name).map(|r| r.probe.clone())?;
        let result = self.run_probe(probe, cancel).await;
        self.apply_result(name, result.clone());
        self.refresh_status();
        Some(result)
    }

    /// One pass of the probe loop
    pub async fn run_probes(&self, cancel: &CancellationToken) {
        let probes: Vec<(String, Arc<dyn ComponentProbe>)> = self
            .components
            .read()
            .iter()
            .map(|(name, r)| (name.clone(), r.probe.clone()))
            .collect();

        let results = join_all(probes.into_iter().map(|(name, probe)| async move {
            let result = self.run_probe(probe, cancel).await;
            (name, result)
        }))
        .await;

        for (name, result) in results {
            self.apply_result(&name, result);
        }
        self.drain_events();
        self.refresh_status();
    }

    fn apply_result(&self, name: &str, result: HealthCheckResult) {
        let new_status = result.status;
        let error = result.error.clone();

        let previous = {
            let mut components = self.components.write();
            let Some(entry) = components.get_mut(name) else {
                return;
            };
            let state = &mut entry.state;
            let previous = state.status;

            state.status = result.status;
            state.last_check = Some(result.timestamp);
            state.response_time_ms = result.response_time_ms;
            state.details = result.details.clone();
            if result.status != HealthStatus::Healthy {
                state.error_count += 1;
            }
            while state.history.len() >= self.config.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(result);
            previous
        };

        self.total_checks.fetch_add(1, Ordering::Relaxed);
        if new_status != HealthStatus::Healthy {
            self.failed_checks.fetch_add(1, Ordering::Relaxed);
        }

        if previous == new_status {
            return;
        }
        info!(component = name, from = %previous, to = %new_status, "component status changed");

        if new_status == HealthStatus::Unhealthy {
            let message = match error {
                Some(e) => format!("component {name} is unhealthy: {e}"),
                None => format!("component {name} is unhealthy"),
            };
            self.alerts.raise(name, AlertSeverity::Critical, message);
        } else if new_status == HealthStatus::Healthy {
            self.alerts.resolve_component(name);
        }
    }

    /// Turn queued reporter events into alerts
    pub fn drain_events(&self) {
        let mut rx = self.events_rx.lock();
        let Some(rx) = rx.as_mut() else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: HealthEvent) {
        match event.kind {
            HealthEventKind::Alert(severity) => {
                debug!(component = %event.component, %severity, "health event");
                self.alerts.raise(&event.component, severity, event.message);
            }
            HealthEventKind::Recovered => {
                let resolved = self.alerts.resolve_component(&event.component);
                debug!(
                    component = %event.component,
                    resolved = resolved.len(),
                    message = %event.message,
                    "health event: recovered"
                );
            }
        }
    }

    fn statuses(&self) -> Vec<HealthStatus> {
        self.components
            .read()
            .values()
            .map(|r| r.state.status)
            .collect()
    }

    /// Cheap status refresh used after every probe pass
    fn refresh_status(&self) {
        let statuses = self.statuses();
        let overall = overall_status(&statuses);
        let mut metrics = self.metrics.write();
        metrics.overall_status = overall;
        metrics.components_total = statuses.len();
        metrics.components_healthy = count(&statuses, HealthStatus::Healthy);
        metrics.components_degraded = count(&statuses, HealthStatus::Degraded);
        metrics.components_unhealthy = count(&statuses, HealthStatus::Unhealthy);
        metrics.active_alerts = self.alerts.active_count();
    }

    /// Full metrics snapshot, run by the metrics loop
    pub fn collect_metrics(&self) -> SystemMetrics {
        let (statuses, response_times): (Vec<HealthStatus>, Vec<u64>) = self
            .components
            .read()
            .values()
            .map(|r| (r.state.status, r.state.response_time_ms))
            .unzip();

        let total_checks = self.total_checks.load(Ordering::Relaxed);
        let failed_checks = self.failed_checks.load(Ordering::Relaxed);
        let avg_response_time_ms = if response_times.is_empty() {
            0.0
        } else {
            response_times.iter().sum::<u64>() as f64 / response_times.len() as f64
        };

        let snapshot = SystemMetrics {
            overall_status: overall_status(&statuses),
            last_update: Some(self.clock.now()),
            components_total: statuses.len(),
            components_healthy: count(&statuses, HealthStatus::Healthy),
            components_degraded: count(&statuses, HealthStatus::Degraded),
            components_unhealthy: count(&statuses, HealthStatus::Unhealthy),
            avg_response_time_ms,
            total_checks,
            failed_checks,
            error_rate: if total_checks == 0 {
                0.0
            } else {
                failed_checks as f64 / total_checks as f64 * 100.0
            },
            active_alerts: self.alerts.active_count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        };

        *self.metrics.write() = snapshot.clone();
        snapshot
    }

    pub fn get_system_health(&self) -> SystemMetrics {
        let mut metrics = self.metrics.read().clone();
        metrics.uptime_secs = self.started_at.elapsed().as_secs();
        metrics
    }

    pub fn get_component_health(&self, name: &str) -> Option<ComponentHealth> {
        self.components
            .read()
            .get(name)
            .map(|r| r.state.snapshot(name))
    }

    pub fn get_all_components(&self) -> BTreeMap<String, ComponentHealth> {
        self.components
            .read()
            .iter()
            .map(|(name, r)| (name.clone(), r.state.snapshot(name)))
            .collect()
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.alerts.active()
    }

    pub fn acknowledge_alert(&self, id: &str) -> Result<Alert, AlertError> {
        self.alerts.acknowledge(id)
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        self.alerts.history()
    }

    /// Flat summary for readiness endpoints
    pub fn get_health_summary(&self) -> Map<String, Value> {
        let system = self.get_system_health();
        let components: Map<String, Value> = self
            .components
            .read()
            .iter()
            .map(|(name, r)| (name.clone(), json!(r.state.status)))
            .collect();

        let mut summary = Map::new();
        summary.insert("overall_status".into(), json!(system.overall_status));
        summary.insert("components_total".into(), json!(system.components_total));
        summary.insert("components_healthy".into(), json!(system.components_healthy));
        summary.insert("components_degraded".into(), json!(system.components_degraded));
        summary.insert("components_unhealthy".into(), json!(system.components_unhealthy));
        summary.insert("error_rate".into(), json!(system.error_rate));
        summary.insert("active_alerts".into(), json!(self.alerts.active_count()));
        summary.insert(
            "uptime_hours".into(),
            json!(system.uptime_secs as f64 / 3600.0),
        );
        summary.insert("last_update".into(), json!(system.last_update));
        summary.insert("components".into(), Value::Object(components));
        summary
    }

    /// Spawn the probe and metrics loops; both stop when `cancel` fires
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, MonitorError> {
        let mut events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or(MonitorError::AlreadyRunning)?;

        info!("starting health monitor");

        let monitor = self.clone();
        let probe_cancel = cancel.clone();
        let probe_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = probe_cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.run_probes(&probe_cancel).await,
                    Some(event) = events_rx.recv() => {
                        monitor.handle_event(event);
                        monitor.refresh_status();
                    }
                }
            }
            debug!("probe loop stopped");
        });

        let monitor = self.clone();
        let metrics_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.metrics_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let m = monitor.collect_metrics();
                        info!(
                            overall = %m.overall_status,
                            healthy = m.components_healthy,
                            degraded = m.components_degraded,
                            unhealthy = m.components_unhealthy,
                            active_alerts = m.active_alerts,
                            "health snapshot"
                        );
                    }
                }
            }
            debug!("metrics loop stopped");
        });

        Ok(vec![probe_loop, metrics_loop])
    }
}

fn count(statuses: &[HealthStatus], wanted: HealthStatus) -> usize {
    statuses.iter().filter(|s| **s == wanted).count()
}
