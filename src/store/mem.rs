use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    KeyRow, ReminderKind, ServerRow, SubscriptionRow, SubscriptionStore, TrafficSampleRow,
};

/// In-memory `SubscriptionStore` for tests and DB-less local runs. Mirrors
/// the Postgres ordering rules (NULL endpoint ids sort last) so both
/// implementations are interchangeable behind the trait.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    subscriptions: Vec<SubscriptionRow>,
    servers: Vec<ServerRow>,
    keys: Vec<KeyRow>,
    samples: Vec<TrafficSampleRow>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        is_active: bool,
    ) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.subscriptions.push(SubscriptionRow {
            id,
            owner_id: 1000 + id,
            name: "Main".into(),
            token: token.to_string(),
            expires_at,
            device_limit: 5,
            is_test: false,
            is_active,
            reminder_7d_at: None,
            reminder_3d_at: None,
            reminder_1d_at: None,
            expired_notice_at: None,
            created_at: Utc::now(),
        });
        id
    }

    pub fn add_server(&self, name: &str, host: &str) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.servers.push(ServerRow {
            id,
            name: name.to_string(),
            host: host.to_string(),
            protocol: "vless".into(),
            api_url: None,
            api_credentials: None,
            capacity: 100,
            is_active: true,
            created_at: Utc::now(),
        });
        id
    }

    pub fn add_key(
        &self,
        subscription_id: i64,
        server_id: Option<i64>,
        payload: serde_json::Value,
        remark: &str,
    ) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.keys.push(KeyRow {
            id,
            subscription_id,
            server_id,
            protocol: "vless".into(),
            remote_id: None,
            payload,
            remark: Some(remark.to_string()),
            is_active: true,
            created_at: Utc::now(),
        });
        id
    }

    pub fn deactivate_key(&self, key_id: i64) {
        let mut state = self.lock();
        if let Some(key) = state.keys.iter_mut().find(|k| k.id == key_id) {
            key.is_active = false;
        }
    }

    pub fn add_sample(
        &self,
        key_id: i64,
        upload_bytes: i64,
        download_bytes: i64,
        recorded_at: DateTime<Utc>,
    ) {
        self.lock().samples.push(TrafficSampleRow {
            key_id,
            upload_bytes,
            download_bytes,
            recorded_at,
        });
    }

    pub fn subscription_by_id(&self, id: i64) -> Option<SubscriptionRow> {
        self.lock().subscriptions.iter().find(|s| s.id == id).cloned()
    }

    pub fn sample_count(&self) -> usize {
        self.lock().samples.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SubscriptionStore for MemStore {
    async fn subscription_by_token(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<SubscriptionRow>> {
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.token == token)
            .cloned())
    }

    async fn active_keys_for_subscription(
        &self,
        subscription_id: i64,
    ) -> anyhow::Result<Vec<KeyRow>> {
        let mut keys: Vec<KeyRow> = self
            .lock()
            .keys
            .iter()
            .filter(|k| k.subscription_id == subscription_id && k.is_active)
            .cloned()
            .collect();
        keys.sort_by_key(|k| (k.server_id.is_none(), k.server_id, k.id));
        Ok(keys)
    }

    async fn servers_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<ServerRow>> {
        Ok(self
            .lock()
            .servers
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn samples_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TrafficSampleRow>> {
        let mut samples: Vec<TrafficSampleRow> = self
            .lock()
            .samples
            .iter()
            .filter(|s| s.recorded_at >= start && s.recorded_at <= end)
            .cloned()
            .collect();
        samples.sort_by_key(|s| (s.key_id, s.recorded_at));
        Ok(samples)
    }

    async fn active_subscriptions(&self) -> anyhow::Result<Vec<SubscriptionRow>> {
        let mut subs: Vec<SubscriptionRow> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.expires_at);
        Ok(subs)
    }

    async fn mark_reminder_sent(
        &self,
        subscription_id: i64,
        kind: ReminderKind,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(sub) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
        {
            let at = Some(Utc::now());
            match kind {
                ReminderKind::SevenDays => sub.reminder_7d_at = at,
                ReminderKind::ThreeDays => sub.reminder_3d_at = at,
                ReminderKind::OneDay => sub.reminder_1d_at = at,
                ReminderKind::Expired => sub.expired_notice_at = at,
            }
        }
        Ok(())
    }

    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.lock();
        let before = state.samples.len();
        state.samples.retain(|s| s.recorded_at >= cutoff);
        Ok((before - state.samples.len()) as u64)
    }
}
