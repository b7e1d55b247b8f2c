//! End-to-end ingestion: session clock -> scheduler -> fallback chain ->
//! publish sink, with the health monitor watching every component.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use nepse_feed::fallback::FallbackChain;
use nepse_feed::health::{HealthMonitor, HealthStatus, HealthThresholds, MonitorConfig};
use nepse_feed::models::{MarketOverview, Quote};
use nepse_feed::publish::LatestQuoteCache;
use nepse_feed::scheduler::{SchedulerConfig, UpdateScheduler};
use nepse_feed::scrapers::{SourceAdapter, SourceError, SourceKind};
use nepse_feed::session::{ManualClock, SessionClock, SessionHours, SessionState, NPT_OFFSET_SECS};

fn npt(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    FixedOffset::east_opt(NPT_OFFSET_SECS)
        .unwrap()
        .with_ymd_and_hms(2024, 3, d, h, m, 0)
        .unwrap()
        .with_timezone(&Utc)
}

/// Adapter whose success can be flipped at runtime; records call windows
struct Switchable {
    name: String,
    healthy: Mutex<bool>,
    delay: Duration,
    calls: AtomicUsize,
    windows: Mutex<Vec<(tokio::time::Instant, tokio::time::Instant)>>,
}

impl Switchable {
    fn new(name: &str, healthy: bool, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            healthy: Mutex::new(healthy),
            delay,
            calls: AtomicUsize::new(0),
            windows: Mutex::new(Vec::new()),
        })
    }

    fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }
}

#[async_trait]
impl SourceAdapter for Switchable {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::HtmlTable
    }

    async fn fetch_quotes(
        &self,
        _cancel: &CancellationToken,
        _symbols: Option<&[String]>,
    ) -> Result<Vec<Quote>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let start = tokio::time::Instant::now();
        tokio::time::sleep(self.delay).await;
        self.windows.lock().push((start, tokio::time::Instant::now()));

        if *self.healthy.lock() {
            Ok(vec![
                Quote::new("NABIL", 1250.0, &self.name),
                Quote::new("NICA", 800.0, &self.name),
            ])
        } else {
            Err(SourceError::http_status(&self.name, 503))
        }
    }

    async fn fetch_overview(&self, _cancel: &CancellationToken) -> Result<MarketOverview, SourceError> {
        Err(SourceError::parse(&self.name, "unsupported"))
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
        Ok(())
    }
}

struct Pipeline {
    scheduler: Arc<UpdateScheduler>,
    chain: Arc<FallbackChain>,
    monitor: Arc<HealthMonitor>,
    cache: Arc<LatestQuoteCache>,
}

fn pipeline(adapters: Vec<Arc<Switchable>>, clock: Arc<ManualClock>) -> Pipeline {
    let monitor = Arc::new(HealthMonitor::with_clock(MonitorConfig::default(), clock.clone()).unwrap());
    let chain = Arc::new(
        FallbackChain::with_clock(
            adapters
                .into_iter()
                .map(|a| a as Arc<dyn SourceAdapter>)
                .collect(),
            HealthThresholds::default(),
            clock.clone(),
        )
        .unwrap()
        .with_reporter(monitor.reporter()),
    );
    for probe in chain.source_probes(MonitorConfig::default().idle_probe_after) {
        monitor.register(probe);
    }
    let cache = Arc::new(LatestQuoteCache::default());
    let session = Arc::new(SessionClock::new(SessionHours::default()).unwrap());
    let scheduler = Arc::new(
        UpdateScheduler::with_clock(
            SchedulerConfig::default(),
            session,
            chain.clone(),
            cache.clone(),
            clock,
        )
        .unwrap(),
    );
    monitor.register(scheduler.clone());
    Pipeline {
        scheduler,
        chain,
        monitor,
        cache,
    }
}

#[tokio::test(start_paused = true)]
async fn primary_outage_falls_back_and_alerts_once() {
    let clock = Arc::new(ManualClock::new(npt(13, 12, 0)));
    let primary = Switchable::new("primary", false, Duration::from_millis(100));
    let backup = Switchable::new("backup", true, Duration::from_millis(100));
    let p = pipeline(vec![primary.clone(), backup.clone()], clock.clone());
    let cancel = CancellationToken::new();

    assert_eq!(p.scheduler.current_state(), SessionState::Open);
    let mut handles = p.scheduler.start(cancel.clone()).unwrap();
    handles.extend(p.monitor.start(cancel.clone()).unwrap());

    // 4 failures on the primary push it past the default threshold of 3
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(p.cache.get("NABIL").unwrap().source, "backup");
    let records = p.chain.health_records();
    assert_eq!(records[0].status, HealthStatus::Unhealthy);
    assert_eq!(records[1].status, HealthStatus::Healthy);
    // primary stops being called once it is unhealthy and cooling down
    assert_eq!(primary.calls.load(Ordering::SeqCst), 4);

    // probe loop runs every 30s, the primary's alert shows up once
    tokio::time::sleep(Duration::from_secs(30)).await;
    let alerts = p.monitor.get_active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].component, "primary");
    assert_eq!(p.monitor.get_system_health().overall_status, HealthStatus::Degraded);

    // recovery after the cooldown resolves the alert
    primary.set_healthy(true);
    clock.advance(chrono::Duration::seconds(61));
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(p.chain.health_records()[0].status, HealthStatus::Healthy);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(p.monitor.get_active_alerts().is_empty());
    assert!(p.monitor.alert_history()[0].resolved);

    cancel.cancel();
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn fetch_windows_never_overlap() {
    let clock = Arc::new(ManualClock::new(npt(13, 12, 0)));
    let slow = Switchable::new("slow", true, Duration::from_secs(25));
    let p = pipeline(vec![slow.clone()], clock);
    let cancel = CancellationToken::new();
    let handles = p.scheduler.start(cancel.clone()).unwrap();

    let forcer = {
        let scheduler = p.scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(20)).await;
                let _ = scheduler.trigger_update("external staleness", &cancel).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_secs(300)).await;
    forcer.await.unwrap();
    cancel.cancel();
    for h in handles {
        h.await.unwrap();
    }

    let mut windows = slow.windows.lock().clone();
    windows.sort_by_key(|w| w.0);
    assert!(windows.len() >= 5);
    for pair in windows.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "fetch windows overlap: {:?}", pair);
    }
    assert!(p.scheduler.stats().skipped_ticks > 0);
}

#[tokio::test]
async fn every_source_down_fails_cycle_without_publishing() {
    let clock = Arc::new(ManualClock::new(npt(13, 12, 0)));
    let a = Switchable::new("a", false, Duration::ZERO);
    let b = Switchable::new("b", false, Duration::ZERO);
    let p = pipeline(vec![a.clone(), b.clone()], clock);
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        assert!(p.scheduler.trigger_update("test", &cancel).await.is_err());
    }
    assert!(p.cache.is_empty());
    assert_eq!(a.calls.load(Ordering::SeqCst), 5);
    assert_eq!(b.calls.load(Ordering::SeqCst), 5);

    // the chain reported the all-unhealthy condition through the monitor
    p.monitor.drain_events();
    assert!(p
        .monitor
        .get_active_alerts()
        .iter()
        .any(|a| a.component == nepse_feed::fallback::CHAIN_COMPONENT));

    let stats = p.scheduler.stats();
    assert_eq!(stats.failed_updates, 5);
    assert_eq!(stats.per_state[&SessionState::Open].failures, 5);
}
