use std::sync::Arc;

use axum::{
    http::{Method, StatusCode},
    routing::get,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::AppState;

pub mod handlers;

/// Build the public subscription router. The caller supplies shared state
/// via `.with_state(...)`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(handlers::service_banner))
        .route("/health", get(handlers::health))
        .route("/sub/:token", get(handlers::subscription_feed))
        .route("/raw/:token", get(handlers::subscription_raw))
        .route("/json/:token", get(handlers::subscription_json))
        .route("/info/:token", get(handlers::subscription_info))
        .route("/cache/stats", get(handlers::cache_stats))
        .layer(TraceLayer::new_for_http())
        .layer(
            // Subscription clients fetch from arbitrary origins; reads only.
            CorsLayer::new()
                .allow_methods([Method::GET])
                .allow_origin(Any),
        )
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
