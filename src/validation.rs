//! Quote sanity checks applied to every fetched batch before publishing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{duration_serde, ConfigError};
use crate::models::Quote;
use crate::session::{SystemClock, WallClock};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub min_price: f64,
    pub max_price: f64,
    /// Absolute daily move; exchange circuit breakers sit at 10%
    pub max_change_percent: f64,
    pub max_volume: u64,
    #[serde(with = "duration_serde")]
    pub future_tolerance: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_price: 1.0,
            max_price: 100_000.0,
            max_change_percent: 50.0,
            max_volume: 100_000_000,
            future_tolerance: Duration::from_secs(5 * 60),
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_price > 0.0 && self.min_price < self.max_price) {
            return Err(ConfigError::invalid(
                "validation.min_price",
                "must be positive and below max_price",
            ));
        }
        if self.max_change_percent <= 0.0 {
            return Err(ConfigError::invalid(
                "validation.max_change_percent",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuoteRejection {
    #[error("malformed symbol {0:?}")]
    Symbol(String),
    #[error("price {0} out of range")]
    Price(f64),
    #[error("change {0:.2}% exceeds limit")]
    Change(f64),
    #[error("volume {0} exceeds limit")]
    Volume(u64),
    #[error("high {high} below low {low}")]
    Range { high: f64, low: f64 },
    #[error("timestamp {0} is in the future")]
    Future(chrono::DateTime<chrono::Utc>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationStats {
    pub checked: u64,
    pub passed: u64,
    pub rejected: u64,
}

pub struct QuoteValidator {
    config: ValidationConfig,
    clock: Arc<dyn WallClock>,
    checked: AtomicU64,
    rejected: AtomicU64,
}

impl QuoteValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ValidationConfig, clock: Arc<dyn WallClock>) -> Self {
        Self {
            config,
            clock,
            checked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn check(&self, quote: &Quote) -> Result<(), QuoteRejection> {
        if !valid_symbol(&quote.symbol) {
            return Err(QuoteRejection::Symbol(quote.symbol.clone()));
        }
        let price = quote.last_price;
        if !price.is_finite() || price < self.config.min_price || price > self.config.max_price {
            return Err(QuoteRejection::Price(price));
        }
        if !quote.change_percent.is_finite()
            || quote.change_percent.abs() > self.config.max_change_percent
        {
            return Err(QuoteRejection::Change(quote.change_percent));
        }
        if quote.volume > self.config.max_volume {
            return Err(QuoteRejection::Volume(quote.volume));
        }
        if quote.high < quote.low {
            return Err(QuoteRejection::Range {
                high: quote.high,
                low: quote.low,
            });
        }
        let tolerance = chrono::Duration::from_std(self.config.future_tolerance)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        if quote.timestamp > self.clock.now() + tolerance {
            return Err(QuoteRejection::Future(quote.timestamp));
        }
        Ok(())
    }

    /// Keep only valid quotes; rejections are logged at debug
    pub fn retain_valid(&self, quotes: Vec<Quote>) -> Vec<Quote> {
        if !self.config.enabled {
            return quotes;
        }
        let total = quotes.len() as u64;
        let kept: Vec<Quote> = quotes
            .into_iter()
            .filter(|q| match self.check(q) {
                Ok(()) => true,
                Err(reason) => {
                    debug!(symbol = %q.symbol, source = %q.source, %reason, "quote rejected");
                    false
                }
            })
            .collect();

        self.checked.fetch_add(total, Ordering::Relaxed);
        self.rejected
            .fetch_add(total - kept.len() as u64, Ordering::Relaxed);
        kept
    }

    pub fn stats(&self) -> ValidationStats {
        let checked = self.checked.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        ValidationStats {
            checked,
            passed: checked.saturating_sub(rejected),
            rejected,
        }
    }
}

/// 2-10 uppercase ASCII letters or digits, leading letter
fn valid_symbol(symbol: &str) -> bool {
    let bytes = symbol.as_bytes();
    (2..=10).contains(&bytes.len())
        && bytes[0].is_ascii_uppercase()
        && bytes
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}
