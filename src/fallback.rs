//! Fallback Chain
//!
//! Ordered sources, primary first. One cycle tries sources in this order:
//! 1. Sources that are not Unhealthy, or whose unhealthy cooldown elapsed
//! 2. Remaining Unhealthy sources (best effort)
//!
//! Each source is called at most once per cycle and the first success wins.
//! Cycles never overlap: a tokio mutex guards the whole cycle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::health::{
    HealthEvent, HealthReporter, HealthStatus, HealthThresholds, SourceHealth, SourceHealthRecord,
    SourceProbe,
};
use crate::models::{MarketOverview, QuoteBatch};
use crate::scrapers::{SourceAdapter, SourceError};
use crate::session::{SystemClock, WallClock};
use crate::validation::QuoteValidator;

pub const CHAIN_COMPONENT: &str = "fallback-chain";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("all {} sources failed this cycle", failures.len())]
    AllSourcesExhausted { failures: Vec<SourceError> },
    #[error("fetch cycle cancelled")]
    Cancelled,
    #[error("a fetch cycle is already in flight")]
    Busy,
}

/// Result of one successful cycle
#[derive(Debug, Clone)]
pub struct CycleOutcome<T> {
    pub value: T,
    pub source: String,
    /// Failures of higher-priority sources tried earlier in the cycle
    pub failures: Vec<SourceError>,
    pub elapsed: Duration,
}

struct ChainEntry {
    adapter: Arc<dyn SourceAdapter>,
    health: Arc<SourceHealth>,
}

pub struct FallbackChain {
    entries: Vec<ChainEntry>,
    cycle_guard: tokio::sync::Mutex<()>,
    validator: Option<Arc<QuoteValidator>>,
    reporter: Option<HealthReporter>,
    clock: Arc<dyn WallClock>,
    /// Set while an all-unhealthy critical event is outstanding
    critical_reported: AtomicBool,
}

impl FallbackChain {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        thresholds: HealthThresholds,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(adapters, thresholds, Arc::new(SystemClock))
    }

    pub fn with_clock(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        thresholds: HealthThresholds,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        if adapters.is_empty() {
            return Err(ConfigError::invalid("sources", "at least one source is required"));
        }

        let entries = adapters
            .into_iter()
            .map(|adapter| {
                let health = Arc::new(SourceHealth::with_clock(
                    adapter.name(),
                    thresholds.clone(),
                    clock.clone(),
                ));
                ChainEntry { adapter, health }
            })
            .collect::<Vec<_>>();

        info!(
            sources = ?entries.iter().map(|e| e.adapter.name()).collect::<Vec<_>>(),
            "fallback chain built"
        );

        Ok(Self {
            entries,
            cycle_guard: tokio::sync::Mutex::new(()),
            validator: None,
            reporter: None,
            clock,
            critical_reported: AtomicBool::new(false),
        })
    }

    pub fn with_validator(mut self, validator: Arc<QuoteValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_reporter(mut self, reporter: HealthReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.adapter.name().to_string())
            .collect()
    }

    /// Shared health handles, for registration with the monitor
    pub fn source_health(&self) -> Vec<Arc<SourceHealth>> {
        self.entries.iter().map(|e| e.health.clone()).collect()
    }

    /// One monitor probe per source, pinging it once fetches go quiet
    pub fn source_probes(&self, idle_after: Duration) -> Vec<Arc<SourceProbe>> {
        self.entries
            .iter()
            .map(|e| Arc::new(SourceProbe::new(e.adapter.clone(), e.health.clone(), idle_after)))
            .collect()
    }

    pub fn health_records(&self) -> Vec<SourceHealthRecord> {
        self.entries.iter().map(|e| e.health.snapshot()).collect()
    }

    pub fn is_busy(&self) -> bool {
        self.cycle_guard.try_lock().is_err()
    }

    /// Name of the source the next cycle would call first
    pub fn select(&self) -> &str {
        let order = self.selection_order();
        order
            .first()
            .map(|&i| self.entries[i].adapter.name())
            .unwrap_or_default()
    }

    fn selection_order(&self) -> Vec<usize> {
        let (mut preferred, rest): (Vec<usize>, Vec<usize>) = (0..self.entries.len())
            .partition(|&i| self.entries[i].health.is_selectable());
        preferred.extend(rest);
        preferred
    }

    fn all_unhealthy(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.health.status() == HealthStatus::Unhealthy)
    }

    /// Waits for any in-flight cycle, then runs one
    pub async fn fetch_cycle(
        &self,
        cancel: &CancellationToken,
        symbols: Option<&[String]>,
    ) -> Result<CycleOutcome<QuoteBatch>, ChainError> {
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(ChainError::Cancelled),
            guard = self.cycle_guard.lock() => guard,
        };
        self.quotes_cycle(cancel, symbols).await
    }

    /// Runs one cycle unless another is in flight
    pub async fn try_fetch_cycle(
        &self,
        cancel: &CancellationToken,
        symbols: Option<&[String]>,
    ) -> Result<CycleOutcome<QuoteBatch>, ChainError> {
        let _guard = self.cycle_guard.try_lock().map_err(|_| ChainError::Busy)?;
        self.quotes_cycle(cancel, symbols).await
    }

    pub async fn fetch_overview(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome<MarketOverview>, ChainError> {
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(ChainError::Cancelled),
            guard = self.cycle_guard.lock() => guard,
        };
        self.run_cycle("overview", cancel, |adapter| async move {
            adapter.fetch_overview(cancel).await
        })
        .await
    }

    async fn quotes_cycle(
        &self,
        cancel: &CancellationToken,
        symbols: Option<&[String]>,
    ) -> Result<CycleOutcome<QuoteBatch>, ChainError> {
        let validator = self.validator.as_deref();
        let clock = &self.clock;
        self.run_cycle("quotes", cancel, |adapter| async move {
            let quotes = adapter.fetch_quotes(cancel, symbols).await?;
            let fetched = quotes.len();
            let quotes = match validator {
                Some(v) => v.retain_valid(quotes),
                None => quotes,
            };
            if quotes.is_empty() {
                return Err(SourceError::parse(
                    adapter.name(),
                    format!("no valid quotes in batch of {fetched}"),
                ));
            }
            if quotes.len() < fetched {
                debug!(
                    source = adapter.name(),
                    dropped = fetched - quotes.len(),
                    "invalid quotes dropped"
                );
            }
            Ok(QuoteBatch {
                quotes,
                source: adapter.name().to_string(),
                fetched_at: clock.now(),
            })
        })
        .await
    }

    async fn run_cycle<T, F, Fut>(
        &self,
        what: &'static str,
        cancel: &CancellationToken,
        attempt: F,
    ) -> Result<CycleOutcome<T>, ChainError>
    where
        F: Fn(Arc<dyn SourceAdapter>) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        if self.all_unhealthy() {
            error!(what, "every source is unhealthy, trying best effort");
            self.critical_reported.store(true, Ordering::SeqCst);
            if let Some(reporter) = &self.reporter {
                reporter.report(HealthEvent::critical(
                    CHAIN_COMPONENT,
                    format!("all {} sources are unhealthy", self.entries.len()),
                ));
            }
        }

        let cycle_start = Instant::now();
        let mut failures = Vec::new();

        for idx in self.selection_order() {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }
            let entry = &self.entries[idx];
            let name = entry.adapter.name();
            let started = Instant::now();

            match attempt(entry.adapter.clone()).await {
                Ok(value) => {
                    entry.health.record_success(started.elapsed());
                    debug!(
                        source = name,
                        what,
                        skipped = failures.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "cycle served"
                    );
                    if self.critical_reported.swap(false, Ordering::SeqCst) {
                        info!(source = name, what, "chain serving again after total outage");
                        if let Some(reporter) = &self.reporter {
                            reporter.report(HealthEvent::recovered(
                                CHAIN_COMPONENT,
                                format!("{name} served a {what} cycle"),
                            ));
                        }
                    }
                    return Ok(CycleOutcome {
                        value,
                        source: name.to_string(),
                        failures,
                        elapsed: cycle_start.elapsed(),
                    });
                }
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                    return Err(ChainError::Cancelled);
                }
                Err(e) => {
                    let status = entry.health.record_failure(&e, started.elapsed());
                    warn!(source = name, what, %status, error = %e, "source failed, advancing");
                    failures.push(e);
                }
            }
        }

        error!(what, failures = failures.len(), "all sources exhausted");
        Err(ChainError::AllSourcesExhausted { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::monitor::HealthMonitor;
    use crate::health::MonitorConfig;
    use crate::models::{MarketOverview, Quote};
    use crate::scrapers::SourceKind;
    use crate::session::ManualClock;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    struct Fake {
        name: String,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: AtomicBool::new(fail),
                calls: AtomicUsize::new(0),
            })
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SourceAdapter for Fake {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> SourceKind {
            SourceKind::JsonApi
        }

        async fn fetch_quotes(
            &self,
            _cancel: &CancellationToken,
            _symbols: Option<&[String]>,
        ) -> Result<Vec<Quote>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::transient(&self.name, "connection reset"));
            }
            Ok(vec![Quote::new("NABIL", 1250.0, &self.name)])
        }

        async fn fetch_overview(&self, _cancel: &CancellationToken) -> Result<MarketOverview, SourceError> {
            Err(SourceError::parse(&self.name, "no overview"))
        }

        async fn probe(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn chain(adapters: Vec<Arc<Fake>>, d: u32) -> FallbackChain {
        FallbackChain::new(
            adapters
                .into_iter()
                .map(|a| a as Arc<dyn SourceAdapter>)
                .collect(),
            HealthThresholds {
                degraded_threshold: d,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failing_primary_called_once() {
        let a = Fake::new("a", true);
        let b = Fake::new("b", false);
        let chain = chain(vec![a.clone(), b.clone()], 3);
        let cancel = CancellationToken::new();

        let out = chain.fetch_cycle(&cancel, None).await.unwrap();
        assert_eq!(out.source, "b");
        assert_eq!(out.value.source, "b");
        assert_eq!(out.failures.len(), 1);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);

        let records = chain.health_records();
        assert_eq!(records[0].status, HealthStatus::Degraded);
        assert_eq!(records[1].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_primary_moves_to_back() {
        let a = Fake::new("a", true);
        let b = Fake::new("b", false);
        let chain = chain(vec![a.clone(), b.clone()], 1);
        let cancel = CancellationToken::new();

        chain.fetch_cycle(&cancel, None).await.unwrap();
        chain.fetch_cycle(&cancel, None).await.unwrap();
        assert_eq!(chain.health_records()[0].status, HealthStatus::Unhealthy);
        assert_eq!(chain.select(), "b");

        chain.fetch_cycle(&cancel, None).await.unwrap();
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_all_fail_exhausts_each_once() {
        let a = Fake::new("a", true);
        let b = Fake::new("b", true);
        let chain = chain(vec![a.clone(), b.clone()], 3);
        let cancel = CancellationToken::new();

        let err = chain.fetch_cycle(&cancel, None).await.unwrap_err();
        match err {
            ChainError::AllSourcesExhausted { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].adapter(), "a");
                assert_eq!(failures[1].adapter(), "b");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_unhealthy_reports_critical_and_tries_primary_first() {
        let monitor = HealthMonitor::new(MonitorConfig::default()).unwrap();
        let a = Fake::new("a", true);
        let b = Fake::new("b", true);
        let chain = chain(vec![a.clone(), b.clone()], 1).with_reporter(monitor.reporter());
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let _ = chain.fetch_cycle(&cancel, None).await;
        }
        assert!(monitor.get_active_alerts().is_empty());
        assert_eq!(chain.select(), "a");

        let _ = chain.fetch_cycle(&cancel, None).await;
        monitor.drain_events();
        let alerts = monitor.get_active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].component, CHAIN_COMPONENT);
        assert_eq!(a.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_chain_alert_resolves_once_a_cycle_is_served() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 13, 6, 0, 0).unwrap()));
        let monitor = HealthMonitor::with_clock(MonitorConfig::default(), clock.clone()).unwrap();
        let a = Fake::new("a", true);
        let chain = FallbackChain::with_clock(
            vec![a.clone() as Arc<dyn SourceAdapter>],
            HealthThresholds {
                degraded_threshold: 1,
                ..Default::default()
            },
            clock.clone(),
        )
        .unwrap()
        .with_reporter(monitor.reporter());
        for health in chain.source_health() {
            monitor.register(health);
        }
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            assert!(chain.fetch_cycle(&cancel, None).await.is_err());
        }
        monitor.run_probes(&cancel).await;
        let components: Vec<String> = monitor
            .get_active_alerts()
            .into_iter()
            .map(|a| a.component)
            .collect();
        assert!(components.contains(&CHAIN_COMPONENT.to_string()));

        a.set_failing(false);
        clock.advance(chrono::Duration::seconds(5));
        let out = chain.fetch_cycle(&cancel, None).await.unwrap();
        assert_eq!(out.value.fetched_at, clock.now());

        monitor.run_probes(&cancel).await;
        assert_eq!(chain.health_records()[0].status, HealthStatus::Healthy);
        assert!(monitor.get_active_alerts().is_empty());
        assert!(monitor
            .alert_history()
            .iter()
            .filter(|a| a.component == CHAIN_COMPONENT)
            .all(|a| a.resolved));

        // a served cycle with no outstanding outage sends nothing more
        chain.fetch_cycle(&cancel, None).await.unwrap();
        monitor.run_probes(&cancel).await;
        assert!(monitor.get_active_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_batch_counts_as_parse_failure() {
        let a = Fake::new("a", false);
        let b = Fake::new("b", false);
        let validator = Arc::new(QuoteValidator::new(crate::validation::ValidationConfig {
            max_price: 1000.0,
            ..Default::default()
        }));
        let chain = chain(vec![a.clone(), b.clone()], 3).with_validator(validator);
        let cancel = CancellationToken::new();

        let err = chain.fetch_cycle(&cancel, None).await.unwrap_err();
        let ChainError::AllSourcesExhausted { failures } = err else {
            panic!("expected exhaustion");
        };
        assert!(failures.iter().all(|f| matches!(f, SourceError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_busy_and_cancelled() {
        let chain = chain(vec![Fake::new("a", false)], 3);
        let cancel = CancellationToken::new();

        let guard = chain.cycle_guard.lock().await;
        assert!(chain.is_busy());
        assert!(matches!(
            chain.try_fetch_cycle(&cancel, None).await,
            Err(ChainError::Busy)
        ));
        drop(guard);

        cancel.cancel();
        assert!(matches!(
            chain.fetch_cycle(&cancel, None).await,
            Err(ChainError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_overview_failures_feed_health() {
        let a = Fake::new("a", false);
        let chain = chain(vec![a], 3);
        let cancel = CancellationToken::new();
        assert!(chain.fetch_overview(&cancel).await.is_err());
        assert_eq!(chain.health_records()[0].consecutive_failures, 1);
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(FallbackChain::new(Vec::new(), HealthThresholds::default()).is_err());
    }
}
