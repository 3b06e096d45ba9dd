use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{
    KeyRow, NewServer, NewSubscription, ReminderKind, ServerRow, SubscriptionRow,
    SubscriptionStore, TrafficSampleRow,
};

const SUBSCRIPTION_COLUMNS: &str = "id, owner_id, name, token, expires_at, device_limit, \
     is_test, is_active, reminder_7d_at, reminder_3d_at, reminder_1d_at, expired_notice_at, \
     created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Grant Operations (CLI) --

    pub async fn insert_subscription(
        &self,
        sub: &NewSubscription,
    ) -> anyhow::Result<SubscriptionRow> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "INSERT INTO subscriptions (owner_id, name, token, expires_at, device_limit, is_test) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(sub.owner_id)
        .bind(&sub.name)
        .bind(&sub.token)
        .bind(sub.expires_at)
        .bind(sub.device_limit)
        .bind(sub.is_test)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_subscriptions(&self) -> anyhow::Result<Vec<SubscriptionRow>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Soft revoke. The cached feed for this token ages out within the
    /// cache TTL.
    pub async fn revoke_subscription(&self, token: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET is_active = FALSE WHERE token = $1 AND is_active",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Endpoint Operations (CLI) --

    pub async fn insert_server(&self, server: &NewServer) -> anyhow::Result<ServerRow> {
        let row = sqlx::query_as::<_, ServerRow>(
            "INSERT INTO servers (name, host, protocol, api_url, capacity) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, name, host, protocol, api_url, api_credentials, capacity, \
                       is_active, created_at",
        )
        .bind(&server.name)
        .bind(&server.host)
        .bind(&server.protocol)
        .bind(&server.api_url)
        .bind(server.capacity)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_servers(&self) -> anyhow::Result<Vec<ServerRow>> {
        let rows = sqlx::query_as::<_, ServerRow>(
            "SELECT id, name, host, protocol, api_url, api_credentials, capacity, \
                    is_active, created_at \
             FROM servers ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// -- Resolution and Job Queries --

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn subscription_by_token(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<SubscriptionRow>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn active_keys_for_subscription(
        &self,
        subscription_id: i64,
    ) -> anyhow::Result<Vec<KeyRow>> {
        let rows = sqlx::query_as::<_, KeyRow>(
            "SELECT id, subscription_id, server_id, protocol, remote_id, payload, remark, \
                    is_active, created_at \
             FROM keys WHERE subscription_id = $1 AND is_active \
             ORDER BY server_id ASC, id ASC",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn servers_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<ServerRow>> {
        let rows = sqlx::query_as::<_, ServerRow>(
            "SELECT id, name, host, protocol, api_url, api_credentials, capacity, \
                    is_active, created_at \
             FROM servers WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn samples_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TrafficSampleRow>> {
        let rows = sqlx::query_as::<_, TrafficSampleRow>(
            "SELECT key_id, upload_bytes, download_bytes, recorded_at \
             FROM traffic_samples WHERE recorded_at >= $1 AND recorded_at <= $2 \
             ORDER BY key_id ASC, recorded_at ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn active_subscriptions(&self) -> anyhow::Result<Vec<SubscriptionRow>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE is_active \
             ORDER BY expires_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_reminder_sent(
        &self,
        subscription_id: i64,
        kind: ReminderKind,
    ) -> anyhow::Result<()> {
        // Column name comes from a closed enum, never from input.
        let sql = format!(
            "UPDATE subscriptions SET {} = NOW() WHERE id = $1",
            kind.column()
        );
        sqlx::query(&sql)
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM traffic_samples WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
