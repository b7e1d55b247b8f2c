//! Adaptive Update Scheduler
//!
//! Two cooperating loops share one cancellation token:
//! - State loop: polls the session clock, records transitions and pushes
//!   the new state over a `watch` channel
//! - Ingestion loop: owns the ticker, rebuilt for every state change, and
//!   runs one fetch cycle per tick
//!
//! A tick that fires while the previous cycle is still running is skipped.
//! Forced updates wait for the in-flight cycle instead of overlapping it.

pub mod stats;

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{duration_serde, ConfigError};
use crate::fallback::{ChainError, FallbackChain};
use crate::health::{ComponentProbe, HealthCheckResult, HealthStatus};
use crate::publish::{PublishError, PublishSink};
use crate::session::{SessionClock, SessionState, SystemClock, WallClock};

pub use stats::{StateCounters, StateTransition, UpdateStats};

pub const SCHEDULER_COMPONENT: &str = "scheduler";

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Regular session
    #[serde(with = "duration_serde")]
    pub active_interval: Duration,
    #[serde(with = "duration_serde")]
    pub pre_market_interval: Duration,
    #[serde(with = "duration_serde")]
    pub post_market_interval: Duration,
    /// Closed and holiday
    #[serde(with = "duration_serde")]
    pub passive_interval: Duration,
    #[serde(with = "duration_serde")]
    pub state_check_interval: Duration,
    #[serde(with = "duration_serde")]
    pub staleness_threshold: Duration,
    pub transition_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(15),
            pre_market_interval: Duration::from_secs(60),
            post_market_interval: Duration::from_secs(2 * 60),
            passive_interval: Duration::from_secs(5 * 60),
            state_check_interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(2 * 60),
            transition_history: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, d) in [
            ("scheduler.active_interval", self.active_interval),
            ("scheduler.pre_market_interval", self.pre_market_interval),
            ("scheduler.post_market_interval", self.post_market_interval),
            ("scheduler.passive_interval", self.passive_interval),
            ("scheduler.state_check_interval", self.state_check_interval),
            ("scheduler.staleness_threshold", self.staleness_threshold),
        ] {
            if d.is_zero() {
                return Err(ConfigError::invalid(field, "must be non-zero"));
            }
        }
        if self.transition_history == 0 {
            return Err(ConfigError::invalid(
                "scheduler.transition_history",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn interval_for(&self, state: SessionState) -> Duration {
        match state {
            SessionState::Open => self.active_interval,
            SessionState::PreMarket => self.pre_market_interval,
            SessionState::PostMarket => self.post_market_interval,
            SessionState::Closed | SessionState::Holiday => self.passive_interval,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("update cycle panicked")]
    Panicked,
    #[error("scheduler already started")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    Scheduled,
    Forced,
}

/// Successful cycle summary
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub source: String,
    pub quotes: usize,
    pub state: SessionState,
    pub elapsed_ms: u64,
}

// =============================================================================
// SCHEDULER
// =============================================================================

struct SchedulerState {
    state_since: DateTime<Utc>,
    transitions: VecDeque<StateTransition>,
    stats: UpdateStats,
}

pub struct UpdateScheduler {
    config: SchedulerConfig,
    staleness_threshold: RwLock<Duration>,
    session: Arc<SessionClock>,
    chain: Arc<FallbackChain>,
    sink: Arc<dyn PublishSink>,
    clock: Arc<dyn WallClock>,
    symbols: Vec<String>,
    inner: RwLock<SchedulerState>,
    state_tx: watch::Sender<SessionState>,
    transitions_tx: broadcast::Sender<StateTransition>,
    running: AtomicBool,
}

impl UpdateScheduler {
    pub fn new(
        config: SchedulerConfig,
        session: Arc<SessionClock>,
        chain: Arc<FallbackChain>,
        sink: Arc<dyn PublishSink>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, session, chain, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SchedulerConfig,
        session: Arc<SessionClock>,
        chain: Arc<FallbackChain>,
        sink: Arc<dyn PublishSink>,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let now = clock.now();
        let state = session.state(now);
        let interval = config.interval_for(state);
        let (state_tx, _) = watch::channel(state);
        let (transitions_tx, _) = broadcast::channel(config.transition_history.max(16));

        info!(
            %state,
            interval_ms = interval.as_millis() as u64,
            sources = chain.len(),
            "update scheduler initialized"
        );

        Ok(Self {
            staleness_threshold: RwLock::new(config.staleness_threshold),
            inner: RwLock::new(SchedulerState {
                state_since: now,
                transitions: VecDeque::with_capacity(config.transition_history),
                stats: UpdateStats::new(now, state, interval),
            }),
            config,
            session,
            chain,
            sink,
            clock,
            symbols: Vec::new(),
            state_tx,
            transitions_tx,
            running: AtomicBool::new(false),
        })
    }

    /// Restrict every fetch to these symbols
    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn current_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn current_interval(&self) -> Duration {
        self.config.interval_for(self.current_state())
    }

    pub fn staleness_threshold(&self) -> Duration {
        *self.staleness_threshold.read()
    }

    pub fn set_staleness_threshold(&self, threshold: Duration) {
        *self.staleness_threshold.write() = threshold;
        info!(threshold_ms = threshold.as_millis() as u64, "staleness threshold updated");
    }

    /// Before the first success, staleness counts from scheduler start
    pub fn is_stale(&self) -> bool {
        let reference = {
            let inner = self.inner.read();
            inner
                .stats
                .last_successful_update
                .unwrap_or(inner.stats.started_at)
        };
        let threshold = chrono::Duration::from_std(self.staleness_threshold())
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        self.clock.now() - reference > threshold
    }

    pub fn stats(&self) -> UpdateStats {
        let mut stats = self.inner.read().stats.clone();
        let state = self.current_state();
        stats.current_state = state;
        stats.current_interval_ms = self.config.interval_for(state).as_millis() as u64;
        stats.uptime_secs = (self.clock.now() - stats.started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs();
        stats
    }

    /// Oldest first
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.inner.read().transitions.iter().cloned().collect()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions_tx.subscribe()
    }

    /// Re-evaluate the session state; returns the transition if it changed
    pub fn check_state(&self) -> Option<StateTransition> {
        let now = self.clock.now();
        let next = self.session.state(now);
        let previous = self.current_state();
        if next == previous {
            return None;
        }

        let transition = {
            let mut inner = self.inner.write();
            let transition = StateTransition {
                from: previous,
                to: next,
                at: now,
                time_in_previous: (now - inner.state_since).to_std().unwrap_or_default(),
            };
            while inner.transitions.len() >= self.config.transition_history {
                inner.transitions.pop_front();
            }
            inner.transitions.push_back(transition.clone());
            inner.state_since = now;
            transition
        };

        self.state_tx.send_replace(next);
        // nobody listening is fine
        let _ = self.transitions_tx.send(transition.clone());

        info!(
            from = %previous,
            to = %next,
            interval_ms = self.config.interval_for(next).as_millis() as u64,
            "session state changed"
        );
        Some(transition)
    }

    /// Out-of-band fetch; waits for any in-flight cycle, still rate limited
    pub async fn trigger_update(
        &self,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<UpdateReport, UpdateError> {
        info!(reason, "forced update requested");
        self.inner.write().stats.forced_updates += 1;
        self.run_update(UpdateKind::Forced, cancel).await
    }

    async fn run_update(
        &self,
        kind: UpdateKind,
        cancel: &CancellationToken,
    ) -> Result<UpdateReport, UpdateError> {
        let state = self.current_state();
        let started = Instant::now();
        let symbols = (!self.symbols.is_empty()).then_some(self.symbols.as_slice());

        let cycle = async {
            let outcome = match kind {
                UpdateKind::Scheduled => self.chain.try_fetch_cycle(cancel, symbols).await?,
                UpdateKind::Forced => self.chain.fetch_cycle(cancel, symbols).await?,
            };
            self.sink.publish(&outcome.value).await?;
            Ok::<_, UpdateError>(outcome)
        };
        let result = match AssertUnwindSafe(cycle).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(%state, "update cycle panicked");
                Err(UpdateError::Panicked)
            }
        };

        let elapsed = started.elapsed();
        let now = self.clock.now();
        match result {
            Ok(outcome) => {
                self.inner
                    .write()
                    .stats
                    .record_success(state, elapsed, &outcome.source, now);
                debug!(
                    %state,
                    source = %outcome.source,
                    quotes = outcome.value.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "update published"
                );
                Ok(UpdateReport {
                    source: outcome.source,
                    quotes: outcome.value.len(),
                    state,
                    elapsed_ms: elapsed.as_millis() as u64,
                })
            }
            Err(UpdateError::Chain(ChainError::Busy)) => {
                self.inner.write().stats.skipped_ticks += 1;
                debug!(%state, "tick skipped, cycle in flight");
                Err(UpdateError::Chain(ChainError::Busy))
            }
            Err(UpdateError::Chain(ChainError::Cancelled)) => {
                debug!(%state, "update cancelled");
                Err(UpdateError::Chain(ChainError::Cancelled))
            }
            Err(e) => {
                let failures = {
                    let mut inner = self.inner.write();
                    inner
                        .stats
                        .record_failure(state, elapsed, e.to_string(), now);
                    inner.stats.consecutive_failures
                };
                warn!(%state, error = %e, consecutive_failures = failures, "update failed");
                Err(e)
            }
        }
    }

    /// Spawn both loops; they stop when `cancel` fires
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, UpdateError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(UpdateError::AlreadyRunning);
        }
        self.check_state();

        let state_loop = tokio::spawn(self.clone().state_loop(cancel.clone()));
        let ingestion_loop = tokio::spawn(self.clone().ingestion_loop(cancel));
        Ok(vec![state_loop, ingestion_loop])
    }

    async fn state_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = new_ticker(self.config.state_check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_state();
                }
            }
        }
        debug!("state loop stopped");
    }

    async fn ingestion_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut state_rx = self.state_tx.subscribe();
        let mut state = *state_rx.borrow_and_update();
        let mut ticker = new_ticker(self.config.interval_for(state));
        let mut in_flight: Option<JoinHandle<()>> = None;

        info!(%state, interval_ms = self.config.interval_for(state).as_millis() as u64, "ingestion loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    state = *state_rx.borrow_and_update();
                    drop(ticker);
                    ticker = new_ticker(self.config.interval_for(state));
                    debug!(%state, "ticker rebuilt");
                }
                _ = ticker.tick() => {
                    if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                        self.inner.write().stats.skipped_ticks += 1;
                        debug!(%state, "tick skipped, cycle in flight");
                        continue;
                    }
                    let scheduler = self.clone();
                    let cycle_cancel = cancel.clone();
                    in_flight = Some(tokio::spawn(async move {
                        let _ = scheduler.run_update(UpdateKind::Scheduled, &cycle_cancel).await;
                    }));
                }
            }
        }

        if let Some(handle) = in_flight {
            if let Err(e) = handle.await {
                warn!(error = %e, "in-flight cycle ended abnormally");
            }
        }
        debug!("ingestion loop stopped");
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[async_trait]
impl ComponentProbe for UpdateScheduler {
    fn component_name(&self) -> &str {
        SCHEDULER_COMPONENT
    }

    async fn probe(&self, _cancel: &CancellationToken) -> HealthCheckResult {
        let stats = self.stats();
        let stale = self.is_stale();
        let state = stats.current_state;

        let mut result = if stale && state == SessionState::Open {
            HealthCheckResult::failed(HealthStatus::Unhealthy, "data is stale during trading hours")
        } else if stats.consecutive_failures > 0 {
            HealthCheckResult::failed(
                HealthStatus::Degraded,
                format!("{} consecutive failed updates", stats.consecutive_failures),
            )
        } else {
            HealthCheckResult::healthy()
        };
        result.response_time_ms = stats.avg_duration_ms as u64;
        result
            .with_detail("state", state.as_str())
            .with_detail("interval_ms", stats.current_interval_ms)
            .with_detail("stale", stale)
            .with_detail("consecutive_failures", stats.consecutive_failures)
            .with_detail("success_rate", stats.success_rate())
            .with_detail(
                "last_successful_update",
                stats.last_successful_update.map(|t| t.to_rfc3339()),
            )
    }
}
