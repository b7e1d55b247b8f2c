//! Bounded retry with exponential backoff and jitter.
//!
//! Every attempt, including the first, goes through the source's rate
//! limiter before touching the network.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::SourceError;
use super::rate_limit::RateLimiter;
use crate::config::duration_serde;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_serde")]
    pub base_delay: Duration,
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.3 = +/-30%)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let raw = base_ms * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_ms = (capped + jitter).max(base_ms).min(self.max_delay.as_millis() as f64);

        Duration::from_millis(final_ms as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(
        &self,
        adapter: &str,
        limiter: &RateLimiter,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            limiter
                .wait(cancel)
                .await
                .map_err(|_| SourceError::cancelled(adapter))?;

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            attempt += 1;
            if !err.is_retryable() || attempt >= attempts {
                if attempt > 1 {
                    warn!(adapter, attempts = attempt, error = %err, "giving up");
                }
                return Err(err);
            }

            let delay = self.delay_for(attempt - 1);
            debug!(adapter, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(SourceError::cancelled(adapter)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
