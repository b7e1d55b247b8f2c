//! Headless-browser source for pages that only render their tables via script.
//!
//! The browser itself sits behind `PageRenderer`. `CommandRenderer` shells
//! out to a local headless Chromium (`--dump-dom`), which is enough for the
//! exchange's market-data page once scripts have settled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::RetryPolicy;
use super::error::SourceError;
use super::parse::QuoteParser;
use super::rate_limit::{RateLimitConfig, RateLimiter};
use super::{filter_symbols, SourceAdapter, SourceKind};
use crate::config::duration_serde;
use crate::models::{MarketOverview, Quote};

/// Failure inside the renderer; always treated as transient
#[derive(Debug, Clone)]
pub struct RenderFailure(pub String);

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Load `url`, let scripts run, and return the resulting document text
    async fn render(&self, url: &str, timeout: Duration) -> Result<String, RenderFailure>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRendererConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Extra wait for client-side rendering, passed as a virtual time budget
    #[serde(with = "duration_serde")]
    pub settle_time: Duration,
}

impl Default for CommandRendererConfig {
    fn default() -> Self {
        Self {
            program: "chromium".to_string(),
            args: vec![
                "--headless".to_string(),
                "--disable-gpu".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-extensions".to_string(),
                "--no-sandbox".to_string(),
            ],
            settle_time: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandRenderer {
    config: CommandRendererConfig,
}

impl CommandRenderer {
    pub fn new(config: CommandRendererConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PageRenderer for CommandRenderer {
    async fn render(&self, url: &str, timeout: Duration) -> Result<String, RenderFailure> {
        let budget = format!("--virtual-time-budget={}", self.config.settle_time.as_millis());
        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(budget)
            .arg("--dump-dom")
            .arg(url)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(RenderFailure(format!("spawn {}: {e}", self.config.program))),
            Err(_) => return Err(RenderFailure(format!("render timed out after {}ms", timeout.as_millis()))),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderFailure(format!(
                "{} exited with {}: {}",
                self.config.program,
                output.status,
                stderr.lines().last().unwrap_or_default()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub quotes_url: String,
    pub overview_url: String,
    #[serde(with = "duration_serde")]
    pub render_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub renderer: CommandRendererConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            quotes_url: "https://nepalstock.com/market-data".to_string(),
            overview_url: "https://nepalstock.com/".to_string(),
            render_timeout: Duration::from_secs(45),
            rate_limit: RateLimitConfig {
                min_interval: Duration::from_secs(5),
                jitter: Duration::from_secs(1),
            },
            retry: RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            },
            renderer: CommandRendererConfig::default(),
        }
    }
}

pub struct BrowserSource {
    name: String,
    config: BrowserConfig,
    renderer: Arc<dyn PageRenderer>,
    limiter: RateLimiter,
    parser: Arc<dyn QuoteParser>,
}

impl BrowserSource {
    pub fn new(
        name: impl Into<String>,
        config: BrowserConfig,
        renderer: Arc<dyn PageRenderer>,
        parser: Arc<dyn QuoteParser>,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Self {
            name: name.into(),
            config,
            renderer,
            limiter,
            parser,
        }
    }

    async fn render_once(&self, url: &str, cancel: &CancellationToken) -> Result<String, SourceError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SourceError::cancelled(&self.name)),
            res = self.renderer.render(url, self.config.render_timeout) => {
                res.map_err(|e| {
                    warn!(source = %self.name, url, error = %e.0, "render failed");
                    SourceError::transient(&self.name, e.0)
                })
            }
        }
    }

    async fn render(&self, url: &str, cancel: &CancellationToken) -> Result<String, SourceError> {
        self.config
            .retry
            .run(&self.name, &self.limiter, cancel, move || self.render_once(url, cancel))
            .await
    }
}

#[async_trait]
impl SourceAdapter for BrowserSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Browser
    }

    async fn fetch_quotes(
        &self,
        cancel: &CancellationToken,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Quote>, SourceError> {
        let doc = self.render(&self.config.quotes_url, cancel).await?;
        let quotes = self
            .parser
            .parse_quotes(&doc, &self.name, Utc::now())
            .map_err(|e| e.into_source_error(&self.name))?;
        debug!(source = %self.name, count = quotes.len(), "parsed rendered table");
        Ok(filter_symbols(quotes, symbols))
    }

    async fn fetch_overview(&self, cancel: &CancellationToken) -> Result<MarketOverview, SourceError> {
        let doc = self.render(&self.config.overview_url, cancel).await?;
        self.parser
            .parse_overview(&doc, &self.name, Utc::now())
            .map_err(|e| e.into_source_error(&self.name))
    }

    async fn probe(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        self.limiter
            .wait(cancel)
            .await
            .map_err(|_| SourceError::cancelled(&self.name))?;
        self.render_once("about:blank", cancel).await.map(|_| ())
    }
}
