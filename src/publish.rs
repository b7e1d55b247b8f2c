//! Publish sinks for successful fetch cycles

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{Quote, QuoteBatch};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, batch: &QuoteBatch) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchInfo {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    pub quotes: usize,
}

#[derive(Default)]
struct CacheState {
    quotes: HashMap<String, Quote>,
    last_batch: Option<BatchInfo>,
}

/// Latest quote per symbol plus a broadcast of every published batch
pub struct LatestQuoteCache {
    state: RwLock<CacheState>,
    tx: broadcast::Sender<Arc<QuoteBatch>>,
}

impl LatestQuoteCache {
    pub fn new(channel_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            state: RwLock::new(CacheState::default()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<QuoteBatch>> {
        self.tx.subscribe()
    }

    pub fn get(&self, symbol: &str) -> Option<Quote> {
        self.state
            .read()
            .quotes
            .get(&symbol.to_uppercase())
            .cloned()
    }

    /// All cached quotes sorted by symbol
    pub fn all(&self) -> Vec<Quote> {
        let mut quotes: Vec<Quote> = self.state.read().quotes.values().cloned().collect();
        quotes.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        quotes
    }

    pub fn len(&self) -> usize {
        self.state.read().quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_batch(&self) -> Option<BatchInfo> {
        self.state.read().last_batch.clone()
    }
}

impl Default for LatestQuoteCache {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl PublishSink for LatestQuoteCache {
    async fn publish(&self, batch: &QuoteBatch) -> Result<(), PublishError> {
        if batch.is_empty() {
            return Err(PublishError::Rejected("empty batch".to_string()));
        }
        {
            let mut state = self.state.write();
            for quote in &batch.quotes {
                state.quotes.insert(quote.symbol.clone(), quote.clone());
            }
            state.last_batch = Some(BatchInfo {
                source: batch.source.clone(),
                fetched_at: batch.fetched_at,
                published_at: Utc::now(),
                quotes: batch.len(),
            });
        }

        // no receivers is fine
        let receivers = self.tx.send(Arc::new(batch.clone())).unwrap_or(0);
        debug!(source = %batch.source, quotes = batch.len(), receivers, "batch published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(source: &str, quotes: Vec<Quote>) -> QuoteBatch {
        QuoteBatch {
            quotes,
            source: source.to_string(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_latest_quote_wins() {
        let cache = LatestQuoteCache::default();
        let mut rx = cache.subscribe();

        cache
            .publish(&batch("a", vec![Quote::new("NABIL", 1250.0, "a"), Quote::new("NICA", 800.0, "a")]))
            .await
            .unwrap();
        cache
            .publish(&batch("b", vec![Quote::new("NABIL", 1260.0, "b")]))
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        let nabil = cache.get("nabil").unwrap();
        assert_eq!(nabil.last_price, 1260.0);
        assert_eq!(nabil.source, "b");
        assert_eq!(cache.all()[0].symbol, "NABIL");
        assert_eq!(cache.last_batch().unwrap().source, "b");

        assert_eq!(rx.recv().await.unwrap().source, "a");
        assert_eq!(rx.recv().await.unwrap().source, "b");
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let cache = LatestQuoteCache::default();
        assert!(matches!(
            cache.publish(&batch("a", Vec::new())).await,
            Err(PublishError::Rejected(_))
        ));
        assert!(cache.last_batch().is_none());
    }
}
