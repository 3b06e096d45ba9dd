use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde_json::json;

use crate::cache::CacheStats;
use crate::errors::AppError;
use crate::feed::{self, CachedFeed};
use crate::uri;
use crate::AppState;

// ── Client headers ───────────────────────────────────────────

/// Headers subscription clients read alongside the body. Values are cheap to
/// rebuild, so cache hits get the same set as fresh resolutions.
fn feed_headers(token_short: &str, expires_epoch: i64) -> [(&'static str, String); 5] {
    let title = STANDARD.encode(format!("Subgate VPN\n{}", token_short));
    [
        ("content-type", "text/plain; charset=utf-8".to_string()),
        ("profile-title", format!("base64:{}", title)),
        ("profile-update-interval", "12".to_string()),
        (
            "subscription-userinfo",
            format!("upload=0; download=0; total=0; expire={}", expires_epoch),
        ),
        (
            "content-disposition",
            "inline; filename=subscription".to_string(),
        ),
    ]
}

fn log_access(route: &'static str, token: &str, headers: &HeaderMap) {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::info!(
        route,
        token = %feed::short_token(token),
        user_agent,
        "subscription request"
    );
}

// ── Handlers ─────────────────────────────────────────────────

/// GET / — service banner with the endpoint map
pub async fn service_banner() -> Json<serde_json::Value> {
    Json(json!({
        "service": "subgate",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "subscription": "/sub/{token}",
            "raw": "/raw/{token}",
            "json": "/json/{token}",
            "info": "/info/{token}",
            "health": "/health",
            "cache_stats": "/cache/stats",
        },
    }))
}

/// GET /health — liveness probe
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /sub/:token — base64 feed body, cache-aside per token
pub async fn subscription_feed(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    log_access("sub", &token, &headers);

    if let Some(cached) = state.cache.get(&token) {
        return Ok((
            feed_headers(&cached.token_short, cached.expires_epoch),
            cached.body,
        ));
    }

    let resolved = feed::resolve_feed(state.store.as_ref(), &token, Utc::now()).await?;
    let cached = CachedFeed {
        body: resolved.encoded_body(),
        token_short: resolved.token_short(),
        expires_epoch: resolved.subscription.expires_at.timestamp(),
    };
    state.cache.set(&token, cached.clone());

    Ok((
        feed_headers(&cached.token_short, cached.expires_epoch),
        cached.body,
    ))
}

/// GET /raw/:token — newline-joined URIs, always resolved fresh
pub async fn subscription_raw(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    log_access("raw", &token, &headers);

    let resolved = feed::resolve_feed(state.store.as_ref(), &token, Utc::now()).await?;
    Ok((
        feed_headers(
            &resolved.token_short(),
            resolved.subscription.expires_at.timestamp(),
        ),
        resolved.plain_body(),
    ))
}

/// GET /json/:token — per-endpoint JSON view of the resolved feed
pub async fn subscription_json(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<serde_json::Value>>, AppError> {
    log_access("json", &token, &headers);

    let resolved = feed::resolve_feed(state.store.as_ref(), &token, Utc::now()).await?;
    let entries: Vec<serde_json::Value> = resolved
        .uris
        .iter()
        .filter_map(|raw| match uri::parse_uri(raw) {
            Ok(p) => Some(json!({
                "type": p.scheme,
                "name": p.remark,
                "server": p.host,
                "port": p.port,
                "uuid": p.identifier,
                "network": p.params.get("type"),
                "security": p.params.get("security"),
                "sni": p.params.get("sni"),
                "flow": p.params.get("flow"),
                "fingerprint": p.params.get("fp"),
                "public_key": p.params.get("pbk"),
                "short_id": p.params.get("sid"),
            })),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable URI in json view");
                None
            }
        })
        .collect();

    if entries.is_empty() {
        return Err(AppError::SubscriptionNotFound);
    }
    Ok(Json(entries))
}

/// GET /info/:token — grant introspection, token masked
pub async fn subscription_info(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<feed::SubscriptionInfo>, AppError> {
    log_access("info", &token, &headers);

    let info = feed::subscription_info(state.store.as_ref(), &token, Utc::now()).await?;
    Ok(Json(info))
}

/// GET /cache/stats — feed cache counters and hit rate
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.cache.stats())
}
