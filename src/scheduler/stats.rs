//! Scheduler counters and state-transition records

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::duration_serde;
use crate::session::SessionState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounters {
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    #[serde(rename = "time_in_previous_ms", with = "duration_serde")]
    pub time_in_previous: Duration,
}

/// Snapshot handed to callers; the scheduler keeps the live copy
#[derive(Debug, Clone, Serialize)]
pub struct UpdateStats {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub current_state: SessionState,
    pub current_interval_ms: u64,
    pub total_updates: u64,
    pub successful_updates: u64,
    pub failed_updates: u64,
    /// Successful cycles while the session was pre-market, open or post-market
    pub active_updates: u64,
    pub passive_updates: u64,
    pub skipped_ticks: u64,
    pub forced_updates: u64,
    pub consecutive_failures: u32,
    pub avg_duration_ms: f64,
    pub per_state: BTreeMap<SessionState, StateCounters>,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_source: Option<String>,
    pub last_error: Option<String>,
}

impl UpdateStats {
    pub(crate) fn new(started_at: DateTime<Utc>, state: SessionState, interval: Duration) -> Self {
        Self {
            started_at,
            uptime_secs: 0,
            current_state: state,
            current_interval_ms: interval.as_millis() as u64,
            total_updates: 0,
            successful_updates: 0,
            failed_updates: 0,
            active_updates: 0,
            passive_updates: 0,
            skipped_ticks: 0,
            forced_updates: 0,
            consecutive_failures: 0,
            avg_duration_ms: 0.0,
            per_state: SessionState::ALL
                .iter()
                .map(|s| (*s, StateCounters::default()))
                .collect(),
            last_successful_update: None,
            last_attempt: None,
            last_source: None,
            last_error: None,
        }
    }

    fn record_duration(&mut self, elapsed: Duration) {
        self.total_updates += 1;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_duration_ms += (ms - self.avg_duration_ms) / self.total_updates as f64;
    }

    pub(crate) fn record_success(
        &mut self,
        state: SessionState,
        elapsed: Duration,
        source: &str,
        at: DateTime<Utc>,
    ) {
        self.record_duration(elapsed);
        self.successful_updates += 1;
        self.consecutive_failures = 0;
        self.last_successful_update = Some(at);
        self.last_attempt = Some(at);
        self.last_source = Some(source.to_string());
        if state.is_trading() {
            self.active_updates += 1;
        } else {
            self.passive_updates += 1;
        }
        self.per_state.entry(state).or_default().successes += 1;
    }

    pub(crate) fn record_failure(
        &mut self,
        state: SessionState,
        elapsed: Duration,
        error: String,
        at: DateTime<Utc>,
    ) {
        self.record_duration(elapsed);
        self.failed_updates += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt = Some(at);
        self.last_error = Some(error);
        self.per_state.entry(state).or_default().failures += 1;
    }

    /// Percentage of attempted cycles that published
    pub fn success_rate(&self) -> f64 {
        if self.total_updates == 0 {
            return 0.0;
        }
        self.successful_updates as f64 / self.total_updates as f64 * 100.0
    }
}
