//! Market data sources
//!
//! Every source implements `SourceAdapter`, owns its own rate limiter and
//! retry budget, and returns classified `SourceError`s tagged with its name.
//! The fallback chain only ever sees the trait object.

pub mod backoff;
pub mod browser;
pub mod error;
pub mod html_table;
pub mod http;
pub mod json_api;
pub mod parse;
pub mod rate_limit;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::{MarketOverview, Quote};

pub use backoff::RetryPolicy;
pub use browser::{BrowserConfig, BrowserSource, CommandRenderer, PageRenderer, RenderFailure};
pub use error::{ParseFailure, SourceError, SourceErrorKind};
pub use html_table::{HtmlTableConfig, HtmlTableSource};
pub use http::{HttpFetcher, HttpSettings};
pub use json_api::{JsonApiConfig, JsonApiSource};
pub use parse::{ColumnLayout, HtmlTableParser, JsonApiParser, PipeRowParser, QuoteParser};
pub use rate_limit::{RateLimitConfig, RateLimiter, WaitCancelled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HtmlTable,
    JsonApi,
    Browser,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HtmlTable => write!(f, "html_table"),
            Self::JsonApi => write!(f, "json_api"),
            Self::Browser => write!(f, "browser"),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Latest quotes, optionally restricted to `symbols`
    async fn fetch_quotes(
        &self,
        cancel: &CancellationToken,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Quote>, SourceError>;

    async fn fetch_overview(&self, cancel: &CancellationToken) -> Result<MarketOverview, SourceError>;

    /// Cheap reachability check; consumes one rate-limit slot
    async fn probe(&self, cancel: &CancellationToken) -> Result<(), SourceError>;
}

pub(crate) fn filter_symbols(quotes: Vec<Quote>, symbols: Option<&[String]>) -> Vec<Quote> {
    let Some(symbols) = symbols.filter(|s| !s.is_empty()) else {
        return quotes;
    };
    let wanted: HashSet<String> = symbols.iter().map(|s| s.trim().to_uppercase()).collect();
    quotes
        .into_iter()
        .filter(|q| wanted.contains(&q.symbol.to_uppercase()))
        .collect()
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// One entry of the configured source list, in priority order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    HtmlTable {
        name: String,
        #[serde(default)]
        columns: ColumnLayout,
        #[serde(flatten)]
        config: HtmlTableConfig,
    },
    JsonApi {
        name: String,
        #[serde(flatten)]
        config: JsonApiConfig,
    },
    Browser {
        name: String,
        #[serde(default)]
        columns: ColumnLayout,
        #[serde(flatten)]
        config: BrowserConfig,
    },
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::HtmlTable { name, .. } | Self::JsonApi { name, .. } | Self::Browser { name, .. } => {
                name
            }
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::HtmlTable { .. } => SourceKind::HtmlTable,
            Self::JsonApi { .. } => SourceKind::JsonApi,
            Self::Browser { .. } => SourceKind::Browser,
        }
    }

    pub fn rate_limit(&self) -> &RateLimitConfig {
        match self {
            Self::HtmlTable { config, .. } => &config.rate_limit,
            Self::JsonApi { config, .. } => &config.rate_limit,
            Self::Browser { config, .. } => &config.rate_limit,
        }
    }

    pub fn retry(&self) -> &RetryPolicy {
        match self {
            Self::HtmlTable { config, .. } => &config.retry,
            Self::JsonApi { config, .. } => &config.retry,
            Self::Browser { config, .. } => &config.retry,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn SourceAdapter>, SourceError> {
        Ok(match self {
            Self::HtmlTable {
                name,
                columns,
                config,
            } => Arc::new(HtmlTableSource::new(
                name.clone(),
                config.clone(),
                Arc::new(HtmlTableParser::new(columns.clone())),
            )?),
            Self::JsonApi { name, config } => {
                Arc::new(JsonApiSource::new(name.clone(), config.clone())?)
            }
            Self::Browser {
                name,
                columns,
                config,
            } => Arc::new(BrowserSource::new(
                name.clone(),
                config.clone(),
                Arc::new(CommandRenderer::new(config.renderer.clone())),
                Arc::new(HtmlTableParser::new(columns.clone())),
            )),
        })
    }

    pub fn defaults() -> Vec<SourceConfig> {
        vec![
            Self::HtmlTable {
                name: "nepse-web".to_string(),
                columns: ColumnLayout::default(),
                config: HtmlTableConfig::default(),
            },
            Self::JsonApi {
                name: "nepse-bot".to_string(),
                config: JsonApiConfig::default(),
            },
            Self::Browser {
                name: "nepse-browser".to_string(),
                columns: ColumnLayout::default(),
                config: BrowserConfig::default(),
            },
        ]
    }
}
