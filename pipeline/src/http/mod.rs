pub mod handlers;
pub mod validation;

use crate::app::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Thin router: every handler parses/validates query parameters and
/// delegates straight into `MetricsReadAPI` / `BucketStore` / `StatusReporter`.
/// No business logic lives here.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tickers", get(handlers::tickers))
        .route("/api/market-data", get(handlers::market_data))
        .route("/metrics", get(handlers::metrics_text))
        .route("/health", get(handlers::health))
        .route("/api/health", get(handlers::api_health))
        .route("/api/health/history", get(handlers::api_health_history))
        .route("/api/cache/status", get(handlers::cache_status))
        .route("/api/cache/refresh", post(handlers::cache_refresh))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
