//! Shared HTTP plumbing for the page and API sources

use std::time::Duration;

use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::error::SourceError;
use crate::config::duration_serde;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) nepse-feed/0.1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    adapter: String,
    client: Client,
    request_timeout: Duration,
    headers: Vec<(String, String)>,
}

impl HttpFetcher {
    pub fn new(adapter: impl Into<String>, settings: &HttpSettings) -> Result<Self, SourceError> {
        let adapter = adapter.into();
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| SourceError::transient(adapter.clone(), format!("client build: {e}")))?;

        Ok(Self {
            adapter,
            client,
            request_timeout: settings.request_timeout,
            headers: Vec::new(),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// GET `url` and return the body; non-2xx statuses are transient failures
    pub async fn get_text(&self, url: &str, cancel: &CancellationToken) -> Result<String, SourceError> {
        let mut request = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/html,application/json;q=0.9,*/*;q=0.8");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let fetch = async {
            let response = request.send().await.map_err(|e| self.classify(e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::http_status(&self.adapter, status.as_u16()));
            }
            response.text().await.map_err(|e| self.classify(e))
        };

        // reqwest enforces the timeout too; this bound also covers body reads
        tokio::select! {
            _ = cancel.cancelled() => Err(SourceError::cancelled(&self.adapter)),
            res = tokio::time::timeout(self.request_timeout, fetch) => match res {
                Ok(inner) => inner,
                Err(_) => Err(SourceError::transient(
                    &self.adapter,
                    format!("request timed out after {}ms", self.request_timeout.as_millis()),
                )),
            },
        }
    }

    fn classify(&self, e: reqwest::Error) -> SourceError {
        if let Some(status) = e.status() {
            return SourceError::http_status(&self.adapter, status.as_u16());
        }
        let what = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connect"
        } else if e.is_body() || e.is_decode() {
            "body"
        } else {
            "request"
        };
        SourceError::transient(&self.adapter, format!("{what}: {e}"))
    }
}
