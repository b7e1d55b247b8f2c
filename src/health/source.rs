//! Per-source health bookkeeping
//!
//! Status is derived from the consecutive-failure count alone:
//! `Healthy` at zero, `Degraded` from 1 through `D`, `Unhealthy` past `D`.
//! A single success resets it. Unhealthy sources become selectable again
//! (half-open) once `unhealthy_cooldown` has passed since their last failure.
//!
//! `SourceProbe` is what the monitor registers per source: the recorded
//! health, plus a direct reachability check while the fetch path is idle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::monitor::{ComponentProbe, HealthCheckResult};
use super::HealthStatus;
use crate::config::{duration_serde, ConfigError};
use crate::scrapers::{SourceAdapter, SourceError, SourceErrorKind};
use crate::session::{SystemClock, WallClock};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// `D`: failures tolerated as Degraded before a source turns Unhealthy
    pub degraded_threshold: u32,
    pub history_capacity: usize,
    /// Number of most recent outcomes used for the success rate
    pub success_window: usize,
    #[serde(with = "duration_serde")]
    pub unhealthy_cooldown: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_threshold: 3,
            history_capacity: 100,
            success_window: 20,
            unhealthy_cooldown: Duration::from_secs(60),
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.degraded_threshold == 0 {
            return Err(ConfigError::invalid(
                "health.degraded_threshold",
                "must be at least 1",
            ));
        }
        if self.history_capacity < self.degraded_threshold as usize + 1 {
            return Err(ConfigError::invalid(
                "health.history_capacity",
                "must hold at least degraded_threshold + 1 outcomes",
            ));
        }
        if self.success_window == 0 || self.success_window > self.history_capacity {
            return Err(ConfigError::invalid(
                "health.success_window",
                "must be between 1 and history_capacity",
            ));
        }
        Ok(())
    }

    pub fn status_for(&self, consecutive_failures: u32) -> HealthStatus {
        match consecutive_failures {
            0 => HealthStatus::Healthy,
            n if n <= self.degraded_threshold => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<SourceErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time copy handed to readers
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealthRecord {
    pub name: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate: f64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub history: Vec<Outcome>,
}

#[derive(Debug, Default)]
struct Inner {
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
    total_successes: u64,
    total_failures: u64,
    history: VecDeque<Outcome>,
}

impl Inner {
    fn push(&mut self, outcome: Outcome, capacity: usize) {
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(outcome);
    }

    fn success_rate(&self, window: usize) -> f64 {
        let recent: Vec<&Outcome> = self.history.iter().rev().take(window).collect();
        if recent.is_empty() {
            return 1.0;
        }
        recent.iter().filter(|o| o.success).count() as f64 / recent.len() as f64
    }
}

pub struct SourceHealth {
    name: String,
    thresholds: HealthThresholds,
    clock: Arc<dyn WallClock>,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for SourceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHealth")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl SourceHealth {
    pub fn new(name: impl Into<String>, thresholds: HealthThresholds) -> Self {
        Self::with_clock(name, thresholds, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        thresholds: HealthThresholds,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        Self {
            name: name.into(),
            thresholds,
            clock,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn record_success(&self, latency: Duration) {
        let now = self.clock.now();
        let previous = {
            let mut inner = self.inner.write();
            let previous = inner.consecutive_failures;
            inner.consecutive_failures = 0;
            inner.last_success = Some(now);
            inner.total_successes += 1;
            inner.push(
                Outcome {
                    at: now,
                    success: true,
                    latency_ms: latency.as_millis() as u64,
                    error_kind: None,
                    error: None,
                },
                self.thresholds.history_capacity,
            );
            previous
        };

        if previous > 0 {
            info!(
                source = %self.name,
                after_failures = previous,
                "source recovered"
            );
        }
    }

    /// Returns the status after recording
    pub fn record_failure(&self, error: &SourceError, latency: Duration) -> HealthStatus {
        let now = self.clock.now();
        let (before, after) = {
            let mut inner = self.inner.write();
            let before = self.thresholds.status_for(inner.consecutive_failures);
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_failure = Some(now);
            inner.last_error = Some(error.to_string());
            inner.total_failures += 1;
            inner.push(
                Outcome {
                    at: now,
                    success: false,
                    latency_ms: latency.as_millis() as u64,
                    error_kind: Some(error.kind()),
                    error: Some(error.to_string()),
                },
                self.thresholds.history_capacity,
            );
            (before, self.thresholds.status_for(inner.consecutive_failures))
        };

        if before != after {
            match after {
                HealthStatus::Unhealthy => warn!(source = %self.name, error = %error, "source unhealthy"),
                _ => info!(source = %self.name, status = %after, error = %error, "source degraded"),
            }
        } else {
            debug!(source = %self.name, status = %after, error = %error, "source failure recorded");
        }
        after
    }

    pub fn status(&self) -> HealthStatus {
        self.thresholds
            .status_for(self.inner.read().consecutive_failures)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.read().consecutive_failures
    }

    pub fn success_rate(&self) -> f64 {
        self.inner.read().success_rate(self.thresholds.success_window)
    }

    /// Unhealthy sources become selectable again after the cooldown
    pub fn is_selectable(&self) -> bool {
        let inner = self.inner.read();
        if self.thresholds.status_for(inner.consecutive_failures) != HealthStatus::Unhealthy {
            return true;
        }
        let Some(last_failure) = inner.last_failure else {
            return true;
        };
        let cooldown = chrono::Duration::from_std(self.thresholds.unhealthy_cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.clock.now() - last_failure >= cooldown
    }

    /// True when no outcome was recorded in the last `period`
    pub fn idle_for(&self, period: Duration) -> bool {
        let last = {
            let inner = self.inner.read();
            inner.last_success.max(inner.last_failure)
        };
        let Some(last) = last else {
            return true;
        };
        let period = chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::minutes(5));
        self.clock.now() - last >= period
    }

    pub fn snapshot(&self) -> SourceHealthRecord {
        let inner = self.inner.read();
        SourceHealthRecord {
            name: self.name.clone(),
            status: self.thresholds.status_for(inner.consecutive_failures),
            consecutive_failures: inner.consecutive_failures,
            last_success: inner.last_success,
            last_failure: inner.last_failure,
            last_error: inner.last_error.clone(),
            success_rate: inner.success_rate(self.thresholds.success_window),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            history: inner.history.iter().cloned().collect(),
        }
    }
}

/// Passive probe: reports what the fetch path already recorded
#[async_trait]
impl ComponentProbe for SourceHealth {
    fn component_name(&self) -> &str {
        &self.name
    }

    async fn probe(&self, _cancel: &CancellationToken) -> HealthCheckResult {
        let snap = self.snapshot();
        let mut result = match snap.last_error {
            Some(ref e) if snap.status != HealthStatus::Healthy => {
                HealthCheckResult::failed(snap.status, e.clone())
            }
            _ => HealthCheckResult::new(snap.status),
        };
        if let Some(latency) = snap.history.last().map(|o| o.latency_ms) {
            result.response_time_ms = latency;
        }
        result
            .with_detail("consecutive_failures", snap.consecutive_failures)
            .with_detail("success_rate", snap.success_rate)
            .with_detail("total_failures", snap.total_failures)
    }
}

pub struct SourceProbe {
    adapter: Arc<dyn SourceAdapter>,
    health: Arc<SourceHealth>,
    idle_after: Duration,
}

impl SourceProbe {
    pub fn new(adapter: Arc<dyn SourceAdapter>, health: Arc<SourceHealth>, idle_after: Duration) -> Self {
        Self {
            adapter,
            health,
            idle_after,
        }
    }
}

#[async_trait]
impl ComponentProbe for SourceProbe {
    fn component_name(&self) -> &str {
        self.health.name()
    }

    async fn probe(&self, cancel: &CancellationToken) -> HealthCheckResult {
        let recorded = self.health.probe(cancel).await;
        if !self.health.idle_for(self.idle_after) {
            return recorded;
        }

        // reachability does not feed SourceHealth, selection follows fetches only
        match self.adapter.probe(cancel).await {
            Ok(()) => recorded.with_detail("reachable", true),
            Err(e) => {
                debug!(source = %self.health.name(), error = %e, "idle reachability check failed");
                let mut result = recorded;
                if result.status == HealthStatus::Healthy {
                    result.status = HealthStatus::Degraded;
                    result.error = Some(format!("reachability check failed: {e}"));
                }
                result.with_detail("reachable", false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManualClock;
    use chrono::TimeZone;

    fn health(d: u32) -> SourceHealth {
        SourceHealth::new(
            "src",
            HealthThresholds {
                degraded_threshold: d,
                ..Default::default()
            },
        )
    }

    fn fail(h: &SourceHealth) -> HealthStatus {
        h.record_failure(&SourceError::transient("src", "timeout"), Duration::from_millis(5))
    }

    #[test]
    fn test_escalation_follows_threshold() {
        let h = health(3);
        assert_eq!(h.status(), HealthStatus::Healthy);
        assert_eq!(fail(&h), HealthStatus::Degraded);
        assert_eq!(fail(&h), HealthStatus::Degraded);
        assert_eq!(fail(&h), HealthStatus::Degraded);
        assert_eq!(fail(&h), HealthStatus::Unhealthy);
        assert_eq!(h.consecutive_failures(), 4);
    }

    #[test]
    fn test_unhealthy_after_exactly_d_plus_one() {
        for d in 1..=5 {
            let h = health(d);
            for _ in 0..d {
                fail(&h);
            }
            assert_ne!(h.status(), HealthStatus::Unhealthy, "d={d}");
            fail(&h);
            assert_eq!(h.status(), HealthStatus::Unhealthy, "d={d}");
        }
    }

    #[test]
    fn test_success_resets_immediately() {
        let h = health(3);
        for _ in 0..10 {
            fail(&h);
        }
        h.record_success(Duration::from_millis(10));
        assert_eq!(h.consecutive_failures(), 0);
        assert_eq!(h.status(), HealthStatus::Healthy);
        assert!(h.snapshot().last_success.is_some());
    }

    #[test]
    fn test_history_bounded_oldest_first() {
        let h = SourceHealth::new(
            "src",
            HealthThresholds {
                history_capacity: 5,
                success_window: 5,
                ..Default::default()
            },
        );
        for _ in 0..3 {
            fail(&h);
        }
        for _ in 0..4 {
            h.record_success(Duration::ZERO);
        }
        let snap = h.snapshot();
        assert_eq!(snap.history.len(), 5);
        // the oldest two failures were evicted
        assert!(!snap.history[0].success);
        assert!(snap.history[1..].iter().all(|o| o.success));
        assert!((snap.success_rate - 0.8).abs() < 1e-9);
        assert_eq!(snap.total_failures, 3);
    }

    #[test]
    fn test_history_entry_reloads_from_json() {
        let h = health(3);
        fail(&h);
        let json = serde_json::to_string(&h.snapshot().history[0]).unwrap();
        assert!(json.contains("\"error_kind\":\"transient_network\""));

        let outcome: Outcome = serde_json::from_str(&json).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(SourceErrorKind::TransientNetwork));
        assert_eq!(outcome.latency_ms, 5);
    }

    #[test]
    fn test_success_rate_uses_recent_window() {
        let h = SourceHealth::new(
            "src",
            HealthThresholds {
                success_window: 2,
                ..Default::default()
            },
        );
        assert_eq!(h.success_rate(), 1.0);
        fail(&h);
        fail(&h);
        h.record_success(Duration::ZERO);
        assert!((h.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 13, 6, 0, 0).unwrap(),
        ));
        let h = SourceHealth::with_clock(
            "src",
            HealthThresholds {
                degraded_threshold: 1,
                unhealthy_cooldown: Duration::from_secs(60),
                ..Default::default()
            },
            clock.clone(),
        );
        fail(&h);
        assert!(h.is_selectable());
        fail(&h);
        assert_eq!(h.status(), HealthStatus::Unhealthy);
        assert!(!h.is_selectable());

        clock.advance(chrono::Duration::seconds(59));
        assert!(!h.is_selectable());
        clock.advance(chrono::Duration::seconds(1));
        assert!(h.is_selectable());
        assert_eq!(h.status(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_probe_reports_recorded_state() {
        let h = health(1);
        let cancel = CancellationToken::new();
        assert_eq!(h.probe(&cancel).await.status, HealthStatus::Healthy);

        fail(&h);
        fail(&h);
        let result = h.probe(&cancel).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.unwrap().contains("timeout"));
        assert_eq!(result.details["consecutive_failures"], 2);
    }

    struct Pingable {
        reachable: std::sync::atomic::AtomicBool,
        pings: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl SourceAdapter for Pingable {
        fn name(&self) -> &str {
            "src"
        }

        fn kind(&self) -> crate::scrapers::SourceKind {
            crate::scrapers::SourceKind::JsonApi
        }

        async fn fetch_quotes(
            &self,
            _cancel: &CancellationToken,
            _symbols: Option<&[String]>,
        ) -> Result<Vec<crate::models::Quote>, SourceError> {
            Err(SourceError::parse("src", "unused"))
        }

        async fn fetch_overview(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<crate::models::MarketOverview, SourceError> {
            Err(SourceError::parse("src", "unused"))
        }

        async fn probe(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
            self.pings.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.reachable.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SourceError::http_status("src", 503))
            }
        }
    }

    #[tokio::test]
    async fn test_source_probe_pings_only_when_idle() {
        use std::sync::atomic::Ordering;

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 13, 6, 0, 0).unwrap()));
        let health = Arc::new(SourceHealth::with_clock("src", HealthThresholds::default(), clock.clone()));
        let adapter = Arc::new(Pingable {
            reachable: std::sync::atomic::AtomicBool::new(false),
            pings: std::sync::atomic::AtomicUsize::new(0),
        });
        let probe = SourceProbe::new(adapter.clone(), health.clone(), Duration::from_secs(300));
        let cancel = CancellationToken::new();
        assert_eq!(probe.component_name(), "src");

        // nothing fetched yet: the adapter is pinged and its failure degrades the result
        let result = probe.probe(&cancel).await;
        assert_eq!(adapter.pings.load(Ordering::SeqCst), 1);
        assert_eq!(result.status, HealthStatus::Degraded);
        assert!(result.error.unwrap().contains("HTTP 503"));
        assert_eq!(result.details["reachable"], false);
        // the ping is not a fetch outcome
        assert_eq!(health.consecutive_failures(), 0);

        // recent fetch activity: the recorded state is reported as is
        health.record_success(Duration::from_millis(20));
        let result = probe.probe(&cancel).await;
        assert_eq!(adapter.pings.load(Ordering::SeqCst), 1);
        assert_eq!(result.status, HealthStatus::Healthy);

        clock.advance(chrono::Duration::minutes(5));
        adapter.reachable.store(true, Ordering::SeqCst);
        let result = probe.probe(&cancel).await;
        assert_eq!(adapter.pings.load(Ordering::SeqCst), 2);
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.details["reachable"], true);
    }

    #[test]
    fn test_thresholds_validation() {
        assert!(HealthThresholds::default().validate().is_ok());
        assert!(HealthThresholds {
            degraded_threshold: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(HealthThresholds {
            degraded_threshold: 5,
            history_capacity: 5,
            success_window: 5,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
