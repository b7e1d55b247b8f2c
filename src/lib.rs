//! NEPSE Feed Library
//!
//! Session-aware ingestion of exchange quotes from unreliable sources:
//! session clock, source adapters, fallback chain, adaptive scheduler and
//! health monitoring. The `nepse-feed` binary wires these together.

pub mod api;
pub mod config;
pub mod fallback;
pub mod health;
pub mod models;
pub mod publish;
pub mod scheduler;
pub mod scrapers;
pub mod session;
pub mod validation;

pub use config::{ConfigError, FeedConfig};
pub use fallback::{ChainError, CycleOutcome, FallbackChain};
pub use health::{HealthMonitor, HealthStatus};
pub use publish::{LatestQuoteCache, PublishSink};
pub use scheduler::{UpdateError, UpdateScheduler};
pub use session::{SessionClock, SessionState};
