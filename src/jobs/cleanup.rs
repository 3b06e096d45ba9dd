//! Background job: prune old traffic samples.
//!
//! Runs daily. Samples are append-only and only feed the trailing 30-day
//! anomaly window, so anything older is dead weight and gets deleted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;

use crate::store::SubscriptionStore;

/// Samples older than this many days are deleted.
const RETENTION_DAYS: i64 = 30;

/// Spawn the background retention task. Call this once at startup.
pub fn spawn(store: Arc<dyn SubscriptionStore>) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(86_400)); // every day
        loop {
            interval.tick().await;
            if let Err(e) = prune_old_samples(store.as_ref(), Utc::now()).await {
                tracing::error!("sample retention job failed: {}", e);
            }
        }
    });
}

async fn prune_old_samples(
    store: &dyn SubscriptionStore,
    now: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let cutoff = now - chrono::Duration::days(RETENTION_DAYS);
    let deleted = store.delete_samples_before(cutoff).await?;

    if deleted > 0 {
        tracing::info!(rows = deleted, "pruned traffic samples past retention");
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn prunes_only_samples_past_retention() {
        let store = MemStore::new();
        let now = Utc::now();
        store.add_sample(1, 100, 200, now - ChronoDuration::days(45));
        store.add_sample(1, 100, 200, now - ChronoDuration::days(31));
        store.add_sample(1, 100, 200, now - ChronoDuration::days(29));
        store.add_sample(2, 100, 200, now - ChronoDuration::hours(1));

        let deleted = prune_old_samples(&store, now).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.sample_count(), 2);

        // A second pass finds nothing left to delete.
        let deleted = prune_old_samples(&store, now).await.unwrap();
        assert_eq!(deleted, 0);
    }
}
