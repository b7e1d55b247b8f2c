use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single traded instrument's price snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last_price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub previous_close: f64,
    pub volume: u64,
    pub turnover: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Adapter that produced this quote
    pub source: String,
}

impl Quote {
    pub fn new(symbol: impl Into<String>, last_price: f64, source: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            last_price,
            change: 0.0,
            change_percent: 0.0,
            open: last_price,
            high: last_price,
            low: last_price,
            previous_close: last_price,
            volume: 0,
            turnover: None,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    pub fn with_change(mut self, previous_close: f64) -> Self {
        self.previous_close = previous_close;
        self.change = self.last_price - previous_close;
        self.change_percent = if previous_close > 0.0 {
            self.change / previous_close * 100.0
        } else {
            0.0
        };
        self
    }

    pub fn with_range(mut self, open: f64, high: f64, low: f64) -> Self {
        self.open = open;
        self.high = high;
        self.low = low;
        self
    }

    pub fn with_volume(mut self, volume: u64) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Index level (NEPSE, sensitive, sector sub-indices)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub name: String,
    pub value: f64,
    pub change: f64,
    pub change_percent: f64,
}

/// Market-wide summary for one fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOverview {
    pub indices: Vec<IndexSnapshot>,
    pub turnover: f64,
    pub volume: u64,
    pub transactions: u64,
    pub as_of: DateTime<Utc>,
    pub source: String,
}

/// Quotes from one successful ingestion cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteBatch {
    pub quotes: Vec<Quote>,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

impl QuoteBatch {
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}
