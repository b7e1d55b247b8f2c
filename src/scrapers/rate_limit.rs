//! Per-source request spacing.
//!
//! Each adapter owns one limiter. Callers reserve the next slot under a
//! short lock and then sleep outside of it, so waiters queue in arrival
//! order and the lock is never held across a suspension point.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::duration_serde;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum spacing between two calls to the same source
    #[serde(with = "duration_serde")]
    pub min_interval: Duration,
    /// Upper bound of the random delay added to each slot
    #[serde(with = "duration_serde")]
    pub jitter: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            jitter: Duration::from_millis(500),
        }
    }
}

/// Returned when the cancellation token fires before the slot opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitCancelled;

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            next_slot: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Reserve the earliest free slot and return when it starts
    fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut next = self.next_slot.lock();
        let slot = match *next {
            Some(t) if t > now => t,
            _ => now,
        };
        *next = Some(slot + self.config.min_interval + self.jitter());
        slot
    }

    /// Wait for this source's next request slot.
    ///
    /// A slot reserved before cancellation stays consumed.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        if cancel.is_cancelled() {
            return Err(WaitCancelled);
        }

        let slot = self.reserve();
        let now = Instant::now();
        if slot <= now {
            return Ok(());
        }

        debug!(wait_ms = (slot - now).as_millis() as u64, "rate limiting");
        tokio::select! {
            _ = cancel.cancelled() => Err(WaitCancelled),
            _ = sleep_until(slot) => Ok(()),
        }
    }
}
