//! Scrapes the exchange's public market pages

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backoff::RetryPolicy;
use super::error::SourceError;
use super::http::{HttpFetcher, HttpSettings};
use super::parse::QuoteParser;
use super::rate_limit::{RateLimitConfig, RateLimiter};
use super::{filter_symbols, SourceAdapter, SourceKind};
use crate::models::{MarketOverview, Quote};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlTableConfig {
    pub base_url: String,
    pub quotes_path: String,
    pub overview_path: String,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub http: HttpSettings,
}

impl Default for HtmlTableConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.nepalstock.com".to_string(),
            quotes_path: "/today-price".to_string(),
            overview_path: "/".to_string(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            http: HttpSettings::default(),
        }
    }
}

pub struct HtmlTableSource {
    name: String,
    config: HtmlTableConfig,
    fetcher: HttpFetcher,
    limiter: RateLimiter,
    parser: Arc<dyn QuoteParser>,
}

impl HtmlTableSource {
    pub fn new(
        name: impl Into<String>,
        config: HtmlTableConfig,
        parser: Arc<dyn QuoteParser>,
    ) -> Result<Self, SourceError> {
        let name = name.into();
        let fetcher = HttpFetcher::new(name.clone(), &config.http)?;
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Ok(Self {
            name,
            config,
            fetcher,
            limiter,
            parser,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str, cancel: &CancellationToken) -> Result<String, SourceError> {
        let url = self.url(path);
        let (fetcher, url) = (&self.fetcher, url.as_str());
        self.config
            .retry
            .run(&self.name, &self.limiter, cancel, move || fetcher.get_text(url, cancel))
            .await
    }
}

#[async_trait]
impl SourceAdapter for HtmlTableSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::HtmlTable
    }

    async fn fetch_quotes(
        &self,
        cancel: &CancellationToken,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Quote>, SourceError> {
        let body = self.get(&self.config.quotes_path, cancel).await?;
        let quotes = self
            .parser
            .parse_quotes(&body, &self.name, Utc::now())
            .map_err(|e| e.into_source_error(&self.name))?;
        debug!(source = %self.name, count = quotes.len(), "parsed quote table");
        Ok(filter_symbols(quotes, symbols))
    }

    async fn fetch_overview(&self, cancel: &CancellationToken) -> Result<MarketOverview, SourceError> {
        let body = self.get(&self.config.overview_path, cancel).await?;
        self.parser
            .parse_overview(&body, &self.name, Utc::now())
            .map_err(|e| e.into_source_error(&self.name))
    }

    async fn probe(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        self.limiter
            .wait(cancel)
            .await
            .map_err(|_| SourceError::cancelled(&self.name))?;
        self.fetcher
            .get_text(&self.url(&self.config.overview_path), cancel)
            .await
            .map(|_| ())
    }
}
