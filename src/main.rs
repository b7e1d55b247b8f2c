//! NEPSE Feed
//!
//! Session-aware quote ingestion service. Polls the configured sources on
//! a cadence that follows the exchange session, falls back across sources
//! when they fail, and exposes health, alerts and stats over HTTP.
//!
//! Usage:
//!   nepse-feed --config feed.toml --bind 0.0.0.0:3000
//!
//! Environment Variables:
//!   NEPSE_FEED_CONFIG - Path to TOML config file
//!   NEPSE_FEED_BIND - HTTP listen address
//!   NEPSE_FEED_DATABASE - SQLite file for trading-day overrides
//!   NEPSE_FEED_LOG_LEVEL - Default log directive when RUST_LOG is unset

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nepse_feed::api::{create_router, AppState};
use nepse_feed::config::FeedConfig;
use nepse_feed::fallback::FallbackChain;
use nepse_feed::health::HealthMonitor;
use nepse_feed::publish::LatestQuoteCache;
use nepse_feed::scheduler::UpdateScheduler;
use nepse_feed::session::{
    MemoryTradingDayStore, SessionClock, SqliteTradingDayStore, TradingDayStore,
};
use nepse_feed::validation::QuoteValidator;

#[derive(Parser, Debug)]
#[command(name = "nepse-feed")]
#[command(about = "Session-aware NEPSE quote ingestion with source fallback and health alerts")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "NEPSE_FEED_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, env = "NEPSE_FEED_BIND")]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "NEPSE_FEED_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// SQLite database for trading-day overrides
    #[arg(long, env = "NEPSE_FEED_DATABASE")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = match &args.config {
        Some(path) => FeedConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => FeedConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(db) = args.database {
        config.database_path = Some(db);
    }
    config.validate().context("Invalid configuration")?;

    info!(
        sources = config.sources.len(),
        symbols = config.symbols.len(),
        "starting nepse-feed"
    );

    let store: Arc<dyn TradingDayStore> = match &config.database_path {
        Some(path) => {
            let store = SqliteTradingDayStore::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            info!(path = %path.display(), "trading-day overrides loaded from sqlite");
            Arc::new(store)
        }
        None => {
            warn!("no database configured, trading-day overrides are in-memory only");
            Arc::new(MemoryTradingDayStore::new())
        }
    };
    let session = Arc::new(SessionClock::new(config.session.clone())?.with_store(store));

    let monitor = Arc::new(HealthMonitor::new(config.monitor.clone())?);

    let adapters = config
        .sources
        .iter()
        .map(|source| source.build())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to build sources")?;
    let validator = Arc::new(QuoteValidator::new(config.validation.clone()));
    let chain = Arc::new(
        FallbackChain::new(adapters, config.health.clone())?
            .with_validator(validator)
            .with_reporter(monitor.reporter()),
    );
    for probe in chain.source_probes(config.monitor.idle_probe_after) {
        monitor.register(probe);
    }

    let cache = Arc::new(LatestQuoteCache::default());
    let scheduler = Arc::new(
        UpdateScheduler::new(
            config.scheduler.clone(),
            session.clone(),
            chain.clone(),
            cache.clone(),
        )?
        .with_symbols(config.symbols.clone()),
    );
    monitor.register(scheduler.clone());

    let shutdown = CancellationToken::new();
    let mut handles = monitor.start(shutdown.clone())?;
    handles.extend(scheduler.start(shutdown.clone())?);

    let app = create_router(AppState {
        monitor,
        scheduler,
        chain,
        cache,
        session,
        shutdown: shutdown.clone(),
    });

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "API server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_signal(server_shutdown).await })
        .await
        .context("Server error")?;

    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("nepse-feed stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for ctrl-c");
                shutdown.cancelled().await;
                return;
            }
            info!("received ctrl-c, shutting down");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("nepse_feed={default_level},tower_http={default_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
