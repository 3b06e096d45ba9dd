pub mod mem;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read and maintenance operations the resolution path and the periodic
/// jobs need from the record store. `PgStore` is the production
/// implementation; `MemStore` backs tests and local development.
///
/// `active_keys_for_subscription` returns rows ordered by `(server_id, id)`,
/// but callers that need ordering re-sort anyway rather than trusting it.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn subscription_by_token(&self, token: &str)
        -> anyhow::Result<Option<SubscriptionRow>>;

    async fn active_keys_for_subscription(
        &self,
        subscription_id: i64,
    ) -> anyhow::Result<Vec<KeyRow>>;

    async fn servers_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<ServerRow>>;

    async fn samples_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TrafficSampleRow>>;

    async fn active_subscriptions(&self) -> anyhow::Result<Vec<SubscriptionRow>>;

    async fn mark_reminder_sent(
        &self,
        subscription_id: i64,
        kind: ReminderKind,
    ) -> anyhow::Result<()>;

    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Expiry-notice tiers. Each maps to its own sent-at column so a tier
/// fires at most once per subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    SevenDays,
    ThreeDays,
    OneDay,
    Expired,
}

impl ReminderKind {
    pub(crate) fn column(self) -> &'static str {
        match self {
            ReminderKind::SevenDays => "reminder_7d_at",
            ReminderKind::ThreeDays => "reminder_3d_at",
            ReminderKind::OneDay => "reminder_1d_at",
            ReminderKind::Expired => "expired_notice_at",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReminderKind::SevenDays => "7_days",
            ReminderKind::ThreeDays => "3_days",
            ReminderKind::OneDay => "1_day",
            ReminderKind::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub device_limit: i32,
    pub is_test: bool,
    pub is_active: bool,
    pub reminder_7d_at: Option<DateTime<Utc>>,
    pub reminder_3d_at: Option<DateTime<Utc>>,
    pub reminder_1d_at: Option<DateTime<Utc>>,
    pub expired_notice_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionRow {
    pub fn reminder_sent(&self, kind: ReminderKind) -> bool {
        match kind {
            ReminderKind::SevenDays => self.reminder_7d_at.is_some(),
            ReminderKind::ThreeDays => self.reminder_3d_at.is_some(),
            ReminderKind::OneDay => self.reminder_1d_at.is_some(),
            ReminderKind::Expired => self.expired_notice_at.is_some(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ServerRow {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub protocol: String,
    pub api_url: Option<String>,
    pub api_credentials: Option<serde_json::Value>,
    pub capacity: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct KeyRow {
    pub id: i64,
    pub subscription_id: i64,
    /// NULL after the endpoint row is deleted; such keys no longer render.
    pub server_id: Option<i64>,
    pub protocol: String,
    pub remote_id: Option<String>,
    pub payload: serde_json::Value,
    pub remark: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TrafficSampleRow {
    pub key_id: i64,
    pub upload_bytes: i64,
    pub download_bytes: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub owner_id: i64,
    pub name: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub device_limit: i32,
    pub is_test: bool,
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub host: String,
    pub protocol: String,
    pub api_url: Option<String>,
    pub capacity: i32,
}
