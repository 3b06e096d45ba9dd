use anyhow::Result;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};

// ── Webhook Event Types ───────────────────────────────────────

/// A structured event payload sent to webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    /// Event type identifier, e.g. "traffic_anomaly", "subscription_expiring".
    pub event_type: String,
    /// ISO-8601 timestamp of when the event occurred.
    pub timestamp: String,
    /// Event-specific details (key id, rule magnitudes, days left, etc.).
    pub details: serde_json::Value,
}

impl WebhookEvent {
    /// A credential tripped one or more traffic rules. `rules` carries the
    /// serialized rule hits with their magnitudes.
    pub fn traffic_anomaly(key_id: i64, rules: serde_json::Value) -> Self {
        Self {
            event_type: "traffic_anomaly".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            details: serde_json::json!({
                "key_id": key_id,
                "rules": rules,
            }),
        }
    }

    pub fn subscription_expiring(
        token_masked: &str,
        owner_id: i64,
        days_left: i64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: "subscription_expiring".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            details: serde_json::json!({
                "token": token_masked,
                "owner_id": owner_id,
                "days_left": days_left,
                "expires_at": expires_at.to_rfc3339(),
            }),
        }
    }

    pub fn subscription_expired(
        token_masked: &str,
        owner_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: "subscription_expired".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            details: serde_json::json!({
                "token": token_masked,
                "owner_id": owner_id,
                "expires_at": expires_at.to_rfc3339(),
            }),
        }
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// Compute HMAC-SHA256 of `payload` using `secret`.
/// Returns lowercase hex digest (e.g. "sha256=<hex>").
fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    let result = mac.finalize();
    let bytes = result.into_bytes();
    format!("sha256={}", hex::encode(bytes))
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Delivers webhook events to configured URLs.
///
/// Bodies are signed with HMAC-SHA256 (X-Subgate-Signature header) when a
/// shared secret is configured. Each delivery retries up to 3 times with
/// exponential back-off (1s → 5s → 25s).
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("Subgate-Webhook/1.0")
                .build()
                .expect("failed to build webhook HTTP client"),
            secret,
        }
    }

    /// Send one event to a single URL with retry.
    /// Returns `Ok(())` if delivery succeeded on any attempt.
    pub async fn send(&self, url: &str, event: &WebhookEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| anyhow::anyhow!("webhook serialize error: {}", e))?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.secret.as_deref().map(|s| hmac_sha256_hex(s, &payload));

        let backoff_secs: &[u64] = &[0, 1, 5, 25];

        for (attempt, &delay) in backoff_secs.iter().enumerate() {
            if delay > 0 {
                tracing::debug!(
                    url,
                    attempt,
                    delay_secs = delay,
                    event_type = %event.event_type,
                    "retrying webhook delivery"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-subgate-delivery-id", &delivery_id)
                .header("x-subgate-timestamp", &timestamp)
                .header("x-subgate-event", &event.event_type);

            if let Some(ref sig) = signature {
                req = req.header("x-subgate-signature", sig.as_str());
            }

            let result = req.body(payload.clone()).send().await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %resp.status(),
                        "webhook delivered successfully"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %status,
                        body = %body,
                        "webhook delivery failed (non-2xx), will retry"
                    );
                }
                Err(e) => {
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        error = %e,
                        "webhook request error, will retry"
                    );
                }
            }
        }

        // All attempts exhausted
        warn!(
            url,
            event_type = %event.event_type,
            delivery_id = %delivery_id,
            "webhook delivery failed after all retries"
        );
        Err(anyhow::anyhow!(
            "webhook delivery failed after 3 retries: {}",
            url
        ))
    }

    /// Deliver an event to every configured URL. Each URL is attempted
    /// independently with retry; one failing never blocks the others.
    /// Returns how many URLs accepted the event, so callers gating
    /// follow-up work (like reminder marks) can tell nothing landed.
    pub async fn dispatch(&self, urls: &[String], event: &WebhookEvent) -> usize {
        let mut delivered = 0;
        for url in urls {
            match self.send(url, event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(url, error = %e, "webhook dispatch ultimately failed"),
            }
        }
        delivered
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new(None)
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traffic_anomaly_event_shape() {
        let rules = serde_json::json!([{ "rule": "excessive_download", "bytes": 1 }]);
        let event = WebhookEvent::traffic_anomaly(42, rules);
        assert_eq!(event.event_type, "traffic_anomaly");
        assert_eq!(event.details["key_id"], 42);
        assert_eq!(event.details["rules"][0]["rule"], "excessive_download");
    }

    #[test]
    fn test_expiring_event_carries_days_left() {
        let event = WebhookEvent::subscription_expiring("abcd1234...wxyz", 7, 3, Utc::now());
        assert_eq!(event.event_type, "subscription_expiring");
        assert_eq!(event.details["days_left"], 3);
        assert_eq!(event.details["token"], "abcd1234...wxyz");
    }

    #[test]
    fn test_expired_event_type() {
        let event = WebhookEvent::subscription_expired("abcd1234...wxyz", 7, Utc::now());
        assert_eq!(event.event_type, "subscription_expired");
        assert_eq!(event.details["owner_id"], 7);
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = WebhookEvent::traffic_anomaly(1, serde_json::json!([]));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("traffic_anomaly"));
        assert!(json.contains("timestamp"));
    }

    #[test]
    fn test_hmac_signature_deterministic() {
        let sig1 = hmac_sha256_hex("secret123", b"payload");
        let sig2 = hmac_sha256_hex("secret123", b"payload");
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("sha256="));
    }

    #[test]
    fn test_hmac_signature_different_secret() {
        let sig1 = hmac_sha256_hex("secret1", b"payload");
        let sig2 = hmac_sha256_hex("secret2", b"payload");
        assert_ne!(sig1, sig2);
    }
}
