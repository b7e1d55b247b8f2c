//! Third-party JSON market API, the usual fallback when the exchange site is down

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backoff::RetryPolicy;
use super::error::SourceError;
use super::http::{HttpFetcher, HttpSettings};
use super::parse::{JsonApiParser, QuoteParser};
use super::rate_limit::{RateLimitConfig, RateLimiter};
use super::{filter_symbols, SourceAdapter, SourceKind};
use crate::models::{MarketOverview, Quote};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonApiConfig {
    pub base_url: String,
    pub quotes_path: String,
    pub overview_path: String,
    pub health_path: String,
    /// Sent as a bearer token when set
    pub api_key: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub http: HttpSettings,
}

impl Default for JsonApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.nepse.bot".to_string(),
            quotes_path: "/top-turnover".to_string(),
            overview_path: "/index".to_string(),
            health_path: "/summary".to_string(),
            api_key: None,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            http: HttpSettings::default(),
        }
    }
}

pub struct JsonApiSource {
    name: String,
    config: JsonApiConfig,
    fetcher: HttpFetcher,
    limiter: RateLimiter,
    parser: Arc<dyn QuoteParser>,
}

impl JsonApiSource {
    pub fn new(name: impl Into<String>, config: JsonApiConfig) -> Result<Self, SourceError> {
        Self::with_parser(name, config, Arc::new(JsonApiParser))
    }

    pub fn with_parser(
        name: impl Into<String>,
        config: JsonApiConfig,
        parser: Arc<dyn QuoteParser>,
    ) -> Result<Self, SourceError> {
        let name = name.into();
        let mut fetcher = HttpFetcher::new(name.clone(), &config.http)?
            .with_header("Accept", "application/json");
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            fetcher = fetcher.with_header("Authorization", format!("Bearer {key}"));
        }
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
impl SourceAdapter for JsonApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::JsonApi
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
        debug!(source = %self.name, count = quotes.len(), "decoded API quotes");
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
            .get_text(&self.url(&self.config.health_path), cancel)
            .await
            .map(|_| ())
    }
}
