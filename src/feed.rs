//! Token resolution: load a grant's credentials, render each as a
//! connection URI in a fixed order, and produce the payload the boundary
//! serves. Repeated resolutions of an unchanged grant are byte-identical,
//! which is what makes the response cache sound.

use std::collections::{BTreeSet, HashMap};

use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::AppError;
use crate::store::{KeyRow, ServerRow, SubscriptionRow, SubscriptionStore};
use crate::uri::{self, ConnectionPayload};

/// Prefix for remarks on feeds whose grant is expired or revoked.
pub const DEGRADED_MARKER: &str = "⏰";

/// A resolved feed: ordered URIs plus the grant row for header building.
#[derive(Debug, Clone)]
pub struct ResolvedFeed {
    pub uris: Vec<String>,
    pub subscription: SubscriptionRow,
    pub degraded: bool,
    pub server_count: usize,
}

impl ResolvedFeed {
    pub fn plain_body(&self) -> String {
        self.uris.join("\n")
    }

    pub fn encoded_body(&self) -> String {
        STANDARD.encode(self.plain_body())
    }

    pub fn token_short(&self) -> String {
        short_token(&self.subscription.token)
    }
}

/// What the boundary caches per token: enough to rebuild the body and the
/// client headers without another resolution.
#[derive(Debug, Clone)]
pub struct CachedFeed {
    pub body: String,
    pub token_short: String,
    pub expires_epoch: i64,
}

/// Introspection payload for `/info/{token}`. The token comes back masked.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub token: String,
    pub is_active: bool,
    pub is_expired: bool,
    pub expires_at: DateTime<Utc>,
    pub days_remaining: i64,
    pub is_test: bool,
    pub device_limit: i32,
    pub key_count: usize,
    pub server_count: usize,
    pub server_ids: Vec<i64>,
    pub protocols: Vec<String>,
}

/// Resolves `token` to a rendered feed.
///
/// Unknown tokens and grants with no active credentials are `NotFound`. An
/// expired or revoked grant still resolves; its remarks are rewritten to the
/// degraded template while connection parameters stay untouched, so clients
/// keep a working config that visibly tells the holder to renew.
pub async fn resolve_feed(
    store: &dyn SubscriptionStore,
    token: &str,
    now: DateTime<Utc>,
) -> Result<ResolvedFeed, AppError> {
    let sub = store
        .subscription_by_token(token)
        .await?
        .ok_or(AppError::SubscriptionNotFound)?;

    let mut keys = store.active_keys_for_subscription(sub.id).await?;
    if keys.is_empty() {
        return Err(AppError::SubscriptionNotFound);
    }

    // Resolution order is part of the contract: ascending endpoint id, then
    // key id. Sorted here rather than trusting whatever the store returned.
    keys.sort_by_key(|k| (k.server_id.is_none(), k.server_id, k.id));

    let server_ids: Vec<i64> = keys
        .iter()
        .filter_map(|k| k.server_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let servers: HashMap<i64, ServerRow> = store
        .servers_by_ids(&server_ids)
        .await?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    let degraded = is_degraded(&sub, now);
    let mut uris = Vec::with_capacity(keys.len());
    let mut rendered_servers = BTreeSet::new();

    for key in &keys {
        match render_key(key, &servers, degraded) {
            Ok((uri, server_id)) => {
                uris.push(uri);
                rendered_servers.insert(server_id);
            }
            Err(reason) => {
                tracing::warn!(key_id = key.id, %reason, "skipping unrenderable key");
            }
        }
    }

    if uris.is_empty() {
        return Err(AppError::Resolution(anyhow!(
            "subscription {} has {} active keys but none rendered",
            sub.id,
            keys.len()
        )));
    }

    Ok(ResolvedFeed {
        uris,
        degraded,
        server_count: rendered_servers.len(),
        subscription: sub,
    })
}

/// Builds the `/info/{token}` payload. Same not-found rules as the feed.
pub async fn subscription_info(
    store: &dyn SubscriptionStore,
    token: &str,
    now: DateTime<Utc>,
) -> Result<SubscriptionInfo, AppError> {
    let sub = store
        .subscription_by_token(token)
        .await?
        .ok_or(AppError::SubscriptionNotFound)?;

    let keys = store.active_keys_for_subscription(sub.id).await?;
    if keys.is_empty() {
        return Err(AppError::SubscriptionNotFound);
    }

    let server_ids: BTreeSet<i64> = keys.iter().filter_map(|k| k.server_id).collect();
    let protocols: BTreeSet<String> = keys.iter().map(|k| k.protocol.clone()).collect();

    Ok(SubscriptionInfo {
        token: mask_token(&sub.token),
        is_active: sub.is_active,
        is_expired: now > sub.expires_at,
        expires_at: sub.expires_at,
        days_remaining: days_remaining(sub.expires_at, now),
        is_test: sub.is_test,
        device_limit: sub.device_limit,
        key_count: keys.len(),
        server_count: server_ids.len(),
        server_ids: server_ids.into_iter().collect(),
        protocols: protocols.into_iter().collect(),
    })
}

fn render_key(
    key: &KeyRow,
    servers: &HashMap<i64, ServerRow>,
    degraded: bool,
) -> anyhow::Result<(String, i64)> {
    let server_id = key
        .server_id
        .ok_or_else(|| anyhow!("key has no endpoint"))?;
    let server = servers
        .get(&server_id)
        .ok_or_else(|| anyhow!("endpoint {} row is gone", server_id))?;

    let payload: ConnectionPayload = serde_json::from_value(key.payload.clone())
        .map_err(|e| anyhow!("unreadable payload: {}", e))?;

    let remark = if degraded {
        degraded_remark(&server.name)
    } else {
        key.remark.clone().unwrap_or_else(|| server.name.clone())
    };

    let uri = uri::format_uri(&key.protocol, &payload, &server.host, &remark)?;
    Ok((uri, server_id))
}

pub fn degraded_remark(server_name: &str) -> String {
    format!("{} {} - Expired, renew subscription", DEGRADED_MARKER, server_name)
}

pub fn is_degraded(sub: &SubscriptionRow, now: DateTime<Utc>) -> bool {
    !sub.is_active || now > sub.expires_at
}

/// Whole days left, rounded up, floored at zero. A grant expiring in one
/// hour still reads as 1 day; an expired one reads 0, never negative.
pub fn days_remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (expires_at - now).num_seconds();
    if secs <= 0 {
        0
    } else {
        (secs + 86_399) / 86_400
    }
}

pub fn short_token(token: &str) -> String {
    token.chars().take(8).collect()
}

pub fn mask_token(token: &str) -> String {
    let len = token.chars().count();
    if len <= 12 {
        return token.to_string();
    }
    let head: String = token.chars().take(8).collect();
    let tail: String = token.chars().skip(len - 4).collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use chrono::Duration;
    use serde_json::json;

    fn payload_json(uuid: &str) -> serde_json::Value {
        json!({
            "uuid": uuid,
            "port": 443,
            "params": { "security": "reality", "pbk": "pk", "sni": "cdn.example.com" }
        })
    }

    fn seeded_store(expires_at: DateTime<Utc>, is_active: bool) -> (MemStore, i64) {
        let store = MemStore::new();
        let sub = store.add_subscription("feedtoken0001feedtoken0001feed01", expires_at, is_active);
        let ams = store.add_server("Amsterdam", "nl1.example.com");
        let fra = store.add_server("Frankfurt", "de1.example.com");
        // Added out of order on purpose.
        store.add_key(sub, Some(fra), payload_json("bbbbbbbb-0000-0000-0000-000000000002"), "DE");
        store.add_key(sub, Some(ams), payload_json("aaaaaaaa-0000-0000-0000-000000000001"), "NL");
        (store, sub)
    }

    #[tokio::test]
    async fn resolution_orders_by_endpoint_then_key() {
        let now = Utc::now();
        let (store, _) = seeded_store(now + Duration::days(10), true);

        let feed = resolve_feed(&store, "feedtoken0001feedtoken0001feed01", now)
            .await
            .unwrap();
        assert_eq!(feed.uris.len(), 2);
        // Amsterdam has the lower server id, so its key renders first.
        assert!(feed.uris[0].contains("nl1.example.com"));
        assert!(feed.uris[1].contains("de1.example.com"));
        assert_eq!(feed.server_count, 2);
        assert!(!feed.degraded);
    }

    #[tokio::test]
    async fn repeated_resolutions_are_byte_identical() {
        let now = Utc::now();
        let (store, _) = seeded_store(now + Duration::days(10), true);

        let a = resolve_feed(&store, "feedtoken0001feedtoken0001feed01", now)
            .await
            .unwrap();
        let b = resolve_feed(&store, "feedtoken0001feedtoken0001feed01", now)
            .await
            .unwrap();
        assert_eq!(a.encoded_body(), b.encoded_body());
    }

    #[tokio::test]
    async fn expired_grant_rewrites_remarks_only() {
        let now = Utc::now();
        let (active_store, _) = seeded_store(now + Duration::days(10), true);
        let (expired_store, _) = seeded_store(now - Duration::hours(1), true);

        let active = resolve_feed(&active_store, "feedtoken0001feedtoken0001feed01", now)
            .await
            .unwrap();
        let expired = resolve_feed(&expired_store, "feedtoken0001feedtoken0001feed01", now)
            .await
            .unwrap();

        assert!(expired.degraded);
        for (a, e) in active.uris.iter().zip(expired.uris.iter()) {
            let a_base = a.split_once('#').unwrap().0;
            let (e_base, e_frag) = e.split_once('#').unwrap();
            assert_eq!(a_base, e_base);
            let frag = urlencoding::decode(e_frag).unwrap();
            assert!(frag.starts_with(DEGRADED_MARKER));
            assert!(frag.contains("Expired"));
        }
    }

    #[tokio::test]
    async fn revoked_grant_is_degraded_too() {
        let now = Utc::now();
        let (store, _) = seeded_store(now + Duration::days(10), false);
        let feed = resolve_feed(&store, "feedtoken0001feedtoken0001feed01", now)
            .await
            .unwrap();
        assert!(feed.degraded);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let store = MemStore::new();
        let err = resolve_feed(&store, "missing", Utc::now()).await.unwrap_err();
        assert!(matches!(err, AppError::SubscriptionNotFound));
    }

    #[tokio::test]
    async fn grant_without_keys_is_not_found() {
        let store = MemStore::new();
        store.add_subscription("tok", Utc::now() + Duration::days(5), true);
        let err = resolve_feed(&store, "tok", Utc::now()).await.unwrap_err();
        assert!(matches!(err, AppError::SubscriptionNotFound));

        let err = subscription_info(&store, "tok", Utc::now()).await.unwrap_err();
        assert!(matches!(err, AppError::SubscriptionNotFound));
    }

    #[tokio::test]
    async fn malformed_key_is_skipped_not_fatal() {
        let now = Utc::now();
        let store = MemStore::new();
        let sub = store.add_subscription("tok", now + Duration::days(5), true);
        let srv = store.add_server("Oslo", "no1.example.com");
        store.add_key(sub, Some(srv), json!({ "port": "not a number" }), "bad");
        store.add_key(sub, Some(srv), payload_json("cccccccc-0000-0000-0000-000000000003"), "ok");

        let feed = resolve_feed(&store, "tok", now).await.unwrap();
        assert_eq!(feed.uris.len(), 1);
        assert!(feed.uris[0].contains("cccccccc"));
    }

    #[tokio::test]
    async fn all_keys_malformed_is_a_resolution_failure() {
        let now = Utc::now();
        let store = MemStore::new();
        let sub = store.add_subscription("tok", now + Duration::days(5), true);
        // No endpoint at all, and a payload with no uuid.
        store.add_key(sub, None, payload_json("dddddddd-0000-0000-0000-000000000004"), "a");
        let srv = store.add_server("Oslo", "no1.example.com");
        store.add_key(sub, Some(srv), json!({ "port": 443 }), "b");

        let err = resolve_feed(&store, "tok", now).await.unwrap_err();
        assert!(matches!(err, AppError::Resolution(_)));
    }

    #[tokio::test]
    async fn info_reports_distinct_servers_and_protocols() {
        let now = Utc::now();
        let (store, _) = seeded_store(now + Duration::hours(36), true);

        let info = subscription_info(&store, "feedtoken0001feedtoken0001feed01", now)
            .await
            .unwrap();
        assert_eq!(info.key_count, 2);
        assert_eq!(info.server_count, 2);
        assert_eq!(info.server_ids.len(), 2);
        assert_eq!(info.protocols, vec!["vless".to_string()]);
        assert_eq!(info.days_remaining, 2);
        assert!(!info.is_expired);
        assert_eq!(info.token, "feedtoke...ed01".to_string());
    }

    #[test]
    fn days_remaining_rounds_up_and_floors_at_zero() {
        let now = Utc::now();
        assert_eq!(days_remaining(now + Duration::hours(1), now), 1);
        assert_eq!(days_remaining(now + Duration::hours(24), now), 1);
        assert_eq!(days_remaining(now + Duration::seconds(86_401), now), 2);
        assert_eq!(days_remaining(now - Duration::hours(5), now), 0);
    }

    #[test]
    fn token_masking() {
        assert_eq!(mask_token("abcdefgh1234efgh5678"), "abcdefgh...5678");
        assert_eq!(mask_token("short"), "short");
        assert_eq!(short_token("abcdefgh1234"), "abcdefgh");
    }
}
