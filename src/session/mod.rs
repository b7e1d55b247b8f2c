//! Trading Session Clock
//!
//! Classifies wall-clock instants into exchange session states and finds
//! the next session boundaries:
//! - Exchange time is NPT (UTC+05:45), fixed offset, no DST
//! - Default hours 11:00-15:00, extended windows 09:00-11:00 and 15:00-17:00
//! - Friday and Saturday are weekly non-trading days
//! - Persisted overrides win over the weekly rule
//!
//! Boundary searches are bounded by `max_lookahead_days`; running past the
//! bound is reported as `SessionError::LookaheadExceeded`.

pub mod store;
pub mod wall;

use std::sync::Arc;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc, Weekday,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ConfigError;

pub use store::{
    MemoryTradingDayStore, SqliteTradingDayStore, StoreError, TradingDayOverride, TradingDayStore,
};
pub use wall::{ManualClock, SystemClock, WallClock};

/// Nepal Time offset from UTC
pub const NPT_OFFSET_SECS: i32 = 5 * 3600 + 45 * 60;

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Closed,
    PreMarket,
    Open,
    PostMarket,
    Holiday,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        SessionState::Closed,
        SessionState::PreMarket,
        SessionState::Open,
        SessionState::PostMarket,
        SessionState::Holiday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::PreMarket => "pre_market",
            Self::Open => "open",
            Self::PostMarket => "post_market",
            Self::Holiday => "holiday",
        }
    }

    /// Open, pre-market and post-market all poll faster than the passive rate
    pub fn is_trading(&self) -> bool {
        matches!(self, Self::PreMarket | Self::Open | Self::PostMarket)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no trading day within {days} days of {from}")]
    LookaheadExceeded { from: DateTime<Utc>, days: u32 },
    #[error("no trading day store configured")]
    NoStore,
    #[error("trading day store: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionHours {
    pub open_hour: u32,
    pub close_hour: u32,
    pub pre_market_open_hour: u32,
    pub post_market_close_hour: u32,
    pub extended_hours: bool,
    pub non_trading_days: Vec<Weekday>,
    pub max_lookahead_days: u32,
    pub utc_offset_secs: i32,
}

impl Default for SessionHours {
    fn default() -> Self {
        Self {
            open_hour: 11,
            close_hour: 15,
            pre_market_open_hour: 9,
            post_market_close_hour: 17,
            extended_hours: true,
            non_trading_days: vec![Weekday::Fri, Weekday::Sat],
            max_lookahead_days: 10,
            utc_offset_secs: NPT_OFFSET_SECS,
        }
    }
}

impl SessionHours {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, hour) in [
            ("session.open_hour", self.open_hour),
            ("session.close_hour", self.close_hour),
            ("session.pre_market_open_hour", self.pre_market_open_hour),
            ("session.post_market_close_hour", self.post_market_close_hour),
        ] {
            if hour > 23 {
                return Err(ConfigError::invalid(field, format!("hour {hour} out of range")));
            }
        }
        if self.close_hour <= self.open_hour {
            return Err(ConfigError::invalid(
                "session.close_hour",
                "must be after open_hour",
            ));
        }
        if self.extended_hours {
            if self.pre_market_open_hour > self.open_hour {
                return Err(ConfigError::invalid(
                    "session.pre_market_open_hour",
                    "must not be after open_hour",
                ));
            }
            if self.post_market_close_hour < self.close_hour {
                return Err(ConfigError::invalid(
                    "session.post_market_close_hour",
                    "must not be before close_hour",
                ));
            }
        }
        if self.non_trading_days.len() >= 7 {
            return Err(ConfigError::invalid(
                "session.non_trading_days",
                "at least one weekday must trade",
            ));
        }
        if self.max_lookahead_days == 0 {
            return Err(ConfigError::invalid(
                "session.max_lookahead_days",
                "must be at least 1",
            ));
        }
        if FixedOffset::east_opt(self.utc_offset_secs).is_none() {
            return Err(ConfigError::invalid(
                "session.utc_offset_secs",
                "offset out of range",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// CLOCK
// =============================================================================

pub struct SessionClock {
    hours: SessionHours,
    offset: FixedOffset,
    open_time: NaiveTime,
    close_time: NaiveTime,
    store: Option<Arc<dyn TradingDayStore>>,
}

impl std::fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClock")
            .field("hours", &self.hours)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl SessionClock {
    pub fn new(hours: SessionHours) -> Result<Self, ConfigError> {
        hours.validate()?;
        let offset = FixedOffset::east_opt(hours.utc_offset_secs)
            .ok_or_else(|| ConfigError::invalid("session.utc_offset_secs", "offset out of range"))?;
        let open_time = NaiveTime::from_hms_opt(hours.open_hour, 0, 0)
            .ok_or_else(|| ConfigError::invalid("session.open_hour", "invalid hour"))?;
        let close_time = NaiveTime::from_hms_opt(hours.close_hour, 0, 0)
            .ok_or_else(|| ConfigError::invalid("session.close_hour", "invalid hour"))?;

        Ok(Self {
            hours,
            offset,
            open_time,
            close_time,
            store: None,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn TradingDayStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn hours(&self) -> &SessionHours {
        &self.hours
    }

    pub fn local_date(&self, t: DateTime<Utc>) -> NaiveDate {
        t.with_timezone(&self.offset).date_naive()
    }

    fn lookup_override(&self, date: NaiveDate) -> Option<TradingDayOverride> {
        let store = self.store.as_ref()?;
        match store.get_override(date) {
            Ok(found) => found,
            Err(e) => {
                warn!(%date, error = %e, "override lookup failed, using weekly rule");
                None
            }
        }
    }

    fn weekly_rule(&self, date: NaiveDate) -> bool {
        !self.hours.non_trading_days.contains(&date.weekday())
    }

    fn is_trading_date(&self, date: NaiveDate) -> bool {
        match self.lookup_override(date) {
            Some(o) => o.is_open,
            None => self.weekly_rule(date),
        }
    }

    pub fn is_trading_day(&self, t: DateTime<Utc>) -> bool {
        self.is_trading_date(self.local_date(t))
    }

    pub fn state(&self, t: DateTime<Utc>) -> SessionState {
        let local = t.with_timezone(&self.offset);
        let date = local.date_naive();

        match self.lookup_override(date) {
            Some(o) if !o.is_open => {
                return if self.weekly_rule(date) {
                    SessionState::Holiday
                } else {
                    SessionState::Closed
                };
            }
            Some(_) => {}
            None if !self.weekly_rule(date) => return SessionState::Closed,
            None => {}
        }

        let hour = local.hour();
        if hour >= self.hours.open_hour && hour < self.hours.close_hour {
            return SessionState::Open;
        }
        if self.hours.extended_hours {
            if hour >= self.hours.pre_market_open_hour && hour < self.hours.open_hour {
                return SessionState::PreMarket;
            }
            if hour >= self.hours.close_hour && hour < self.hours.post_market_close_hour {
                return SessionState::PostMarket;
            }
        }
        SessionState::Closed
    }

    pub fn is_open(&self, t: DateTime<Utc>) -> bool {
        self.state(t) == SessionState::Open
    }

    fn at_local(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = NaiveDateTime::new(date, time);
        Utc.from_utc_datetime(&(local - Duration::seconds(i64::from(self.hours.utc_offset_secs))))
    }

    fn next_boundary(&self, from: DateTime<Utc>, time: NaiveTime) -> Result<DateTime<Utc>, SessionError> {
        let mut date = self.local_date(from);
        if self.at_local(date, time) <= from {
            date = date.succ_opt().unwrap_or(date);
        }

        // inspects exactly `max_lookahead_days` dates
        for _ in 0..self.hours.max_lookahead_days {
            if self.is_trading_date(date) {
                return Ok(self.at_local(date, time));
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        Err(SessionError::LookaheadExceeded {
            from,
            days: self.hours.max_lookahead_days,
        })
    }

    /// First regular-session open strictly after `from`
    pub fn next_open(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, SessionError> {
        self.next_boundary(from, self.open_time)
    }

    /// First regular-session close strictly after `from`
    pub fn next_close(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, SessionError> {
        self.next_boundary(from, self.close_time)
    }

    /// Zero while the regular session is open
    pub fn until_open(&self, t: DateTime<Utc>) -> Result<Duration, SessionError> {
        if self.is_open(t) {
            return Ok(Duration::zero());
        }
        Ok(self.next_open(t)? - t)
    }

    /// Zero while the regular session is closed
    pub fn until_close(&self, t: DateTime<Utc>) -> Result<Duration, SessionError> {
        if !self.is_open(t) {
            return Ok(Duration::zero());
        }
        Ok(self.next_close(t)? - t)
    }

    pub fn record_override(
        &self,
        date: NaiveDate,
        is_open: bool,
        status: impl Into<String>,
    ) -> Result<(), SessionError> {
        let store = self.store.as_ref().ok_or(SessionError::NoStore)?;
        let record = TradingDayOverride {
            date,
            is_open,
            status: status.into(),
        };
        store.upsert_override(&record)?;
        info!(%date, is_open, status = %record.status, "trading day override recorded");
        Ok(())
    }
}
