use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::fallback::{ChainError, FallbackChain};
use crate::health::{AlertError, HealthMonitor, HealthStatus};
use crate::models::{MarketOverview, Quote};
use crate::publish::LatestQuoteCache;
use crate::scheduler::{UpdateError, UpdateReport, UpdateScheduler};
use crate::session::{SessionClock, SessionState};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<HealthMonitor>,
    pub scheduler: Arc<UpdateScheduler>,
    pub chain: Arc<FallbackChain>,
    pub cache: Arc<LatestQuoteCache>,
    pub session: Arc<SessionClock>,
    pub shutdown: CancellationToken,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/components", get(get_components))
        .route("/alerts", get(get_alerts))
        .route("/alerts/:id/ack", post(ack_alert))
        .route("/stats", get(get_stats))
        .route("/session", get(get_session))
        .route("/quotes", get(get_quotes))
        .route("/overview", get(get_overview))
        .route("/update", post(post_update))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

/// Readiness: 503 once the system as a whole is unhealthy
async fn health_check(State(state): State<AppState>) -> Response {
    let summary = state.monitor.get_health_summary();
    let status = if state.monitor.get_system_health().overall_status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(summary)).into_response()
}

async fn get_components(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "system": state.monitor.get_system_health(),
        "components": state.monitor.get_all_components(),
    }))
}

async fn get_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertQuery>,
) -> Json<serde_json::Value> {
    let alerts = if params.history.unwrap_or(false) {
        state.monitor.alert_history()
    } else {
        state.monitor.get_active_alerts()
    };
    Json(json!({
        "count": alerts.len(),
        "suppressed": state.monitor.alerts().suppressed_count(),
        "alerts": alerts,
    }))
}

async fn ack_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::health::Alert>, ApiError> {
    Ok(Json(state.monitor.acknowledge_alert(&id)?))
}

async fn get_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "scheduler": state.scheduler.stats(),
        "stale": state.scheduler.is_stale(),
        "transitions": state.scheduler.transitions(),
        "sources": state.chain.health_records(),
        "cached_symbols": state.cache.len(),
        "last_batch": state.cache.last_batch(),
    }))
}

async fn get_session(State(state): State<AppState>) -> Json<SessionResponse> {
    let now = Utc::now();
    Json(SessionResponse {
        state: state.session.state(now),
        scheduler_state: state.scheduler.current_state(),
        is_trading_day: state.session.is_trading_day(now),
        next_open: state.session.next_open(now).ok().map(|t| t.to_rfc3339()),
        next_close: state.session.next_close(now).ok().map(|t| t.to_rfc3339()),
        interval_ms: state.scheduler.current_interval().as_millis() as u64,
    })
}

async fn get_quotes(
    State(state): State<AppState>,
    Query(params): Query<QuoteQuery>,
) -> Result<Json<QuotesResponse>, ApiError> {
    let quotes = match params.symbol {
        Some(symbol) => {
            let quote = state
                .cache
                .get(&symbol)
                .ok_or_else(|| ApiError::NotFound(format!("No quote for {}", symbol)))?;
            vec![quote]
        }
        None => state.cache.all(),
    };
    Ok(Json(QuotesResponse {
        count: quotes.len(),
        quotes,
    }))
}

/// Fetched on demand through the chain, same fallback and rate limits as quotes
async fn get_overview(State(state): State<AppState>) -> Result<Json<OverviewResponse>, ApiError> {
    let outcome = state.chain.fetch_overview(&state.shutdown).await?;
    Ok(Json(OverviewResponse {
        source: outcome.source,
        fallbacks: outcome.failures.len(),
        elapsed_ms: outcome.elapsed.as_millis() as u64,
        overview: outcome.value,
    }))
}

async fn post_update(State(state): State<AppState>) -> Result<Json<UpdateReport>, ApiError> {
    let report = state
        .scheduler
        .trigger_update("api request", &state.shutdown)
        .await?;
    Ok(Json(report))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct AlertQuery {
    /// Include resolved alerts
    history: Option<bool>,
}

#[derive(Deserialize)]
struct QuoteQuery {
    symbol: Option<String>,
}

#[derive(Serialize)]
struct QuotesResponse {
    count: usize,
    quotes: Vec<Quote>,
}

#[derive(Serialize)]
struct OverviewResponse {
    source: String,
    /// Sources that failed before `source` served
    fallbacks: usize,
    elapsed_ms: u64,
    overview: MarketOverview,
}

#[derive(Serialize)]
struct SessionResponse {
    state: SessionState,
    scheduler_state: SessionState,
    is_trading_day: bool,
    next_open: Option<String>,
    next_close: Option<String>,
    interval_ms: u64,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Upstream(String),
    Unavailable(String),
}

impl From<AlertError> for ApiError {
    fn from(err: AlertError) -> Self {
        ApiError::NotFound(err.to_string())
    }
}

impl From<UpdateError> for ApiError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::Chain(chain) => chain.into(),
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Cancelled => ApiError::Unavailable(err.to_string()),
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Upstream(msg) => {
                tracing::warn!(error = %msg, "upstream fetch failed");
                (StatusCode::BAD_GATEWAY, msg)
            }
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ComponentProbe, HealthCheckResult, HealthThresholds, MonitorConfig};
    use crate::scheduler::SchedulerConfig;
    use crate::scrapers::{SourceAdapter, SourceError, SourceKind};
    use crate::session::SessionHours;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Down;

    #[async_trait]
    impl ComponentProbe for Down {
        fn component_name(&self) -> &str {
            "down"
        }

        async fn probe(&self, _cancel: &CancellationToken) -> HealthCheckResult {
            HealthCheckResult::failed(HealthStatus::Unhealthy, "unreachable")
        }
    }

    struct Static;

    #[async_trait]
    impl SourceAdapter for Static {
        fn name(&self) -> &str {
            "static"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::JsonApi
        }

        async fn fetch_quotes(
            &self,
            _cancel: &CancellationToken,
            _symbols: Option<&[String]>,
        ) -> Result<Vec<Quote>, SourceError> {
            Ok(vec![Quote::new("NABIL", 1250.0, "static")])
        }

        async fn fetch_overview(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<MarketOverview, SourceError> {
            Ok(MarketOverview {
                indices: vec![crate::models::IndexSnapshot {
                    name: "NEPSE".to_string(),
                    value: 2104.5,
                    change: 12.3,
                    change_percent: 0.59,
                }],
                turnover: 3.2e9,
                volume: 8_500_000,
                transactions: 61_000,
                as_of: Utc::now(),
                source: "static".to_string(),
            })
        }

        async fn probe(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn state() -> AppState {
        let session = Arc::new(SessionClock::new(SessionHours::default()).unwrap());
        let chain = Arc::new(
            FallbackChain::new(
                vec![Arc::new(Static) as Arc<dyn SourceAdapter>],
                HealthThresholds::default(),
            )
            .unwrap(),
        );
        let cache = Arc::new(LatestQuoteCache::default());
        let scheduler = Arc::new(
            UpdateScheduler::new(
                SchedulerConfig::default(),
                session.clone(),
                chain.clone(),
                cache.clone(),
            )
            .unwrap(),
        );
        AppState {
            monitor: Arc::new(HealthMonitor::new(MonitorConfig::default()).unwrap()),
            scheduler,
            chain,
            cache,
            session,
            shutdown: CancellationToken::new(),
        }
    }

    async fn send(app: Router, method: &str, uri: &str) -> StatusCode {
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
    }

    #[tokio::test]
    async fn test_health_turns_503_when_unhealthy() {
        let state = state();
        assert_eq!(send(create_router(state.clone()), "GET", "/health").await, StatusCode::OK);

        state.monitor.register(Arc::new(Down));
        state.monitor.run_probes(&CancellationToken::new()).await;
        assert_eq!(
            send(create_router(state), "GET", "/health").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_update_then_quotes() {
        let state = state();
        assert_eq!(
            send(create_router(state.clone()), "GET", "/quotes?symbol=NABIL").await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(send(create_router(state.clone()), "POST", "/update").await, StatusCode::OK);
        assert_eq!(
            send(create_router(state.clone()), "GET", "/quotes?symbol=nabil").await,
            StatusCode::OK
        );
        assert_eq!(state.scheduler.stats().forced_updates, 1);
    }

    #[tokio::test]
    async fn test_overview_served_through_chain() {
        let state = state();
        let response = create_router(state.clone())
            .oneshot(Request::builder().uri("/overview").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["source"], "static");
        assert_eq!(json["fallbacks"], 0);
        assert_eq!(json["overview"]["indices"][0]["name"], "NEPSE");
        assert_eq!(state.chain.health_records()[0].total_successes, 1);

        state.shutdown.cancel();
        assert_eq!(
            send(create_router(state), "GET", "/overview").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_ack_unknown_alert_is_404() {
        assert_eq!(
            send(create_router(state()), "POST", "/alerts/nope/ack").await,
            StatusCode::NOT_FOUND
        );
    }
}
