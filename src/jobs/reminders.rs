//! Expiry reminder job.
//!
//! Runs hourly. Walks active grants and fires one webhook event per tier
//! (7 days left, 3 days, 1 day, expired) as a grant approaches its expiry.
//! Each tier is marked in the store after a delivery lands, so a tier fires
//! at most once per grant; failed deliveries retry on the next tick.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::feed;
use crate::notification::webhook::{WebhookEvent, WebhookNotifier};
use crate::store::{ReminderKind, SubscriptionRow, SubscriptionStore};

/// The most urgent tier this grant is due for, or None when up to date.
/// Skipped tiers are not back-filled; only the current one fires.
fn due_reminder(sub: &SubscriptionRow, now: DateTime<Utc>) -> Option<ReminderKind> {
    let kind = if now > sub.expires_at {
        ReminderKind::Expired
    } else {
        match feed::days_remaining(sub.expires_at, now) {
            0 | 1 => ReminderKind::OneDay,
            2 | 3 => ReminderKind::ThreeDays,
            4..=7 => ReminderKind::SevenDays,
            _ => return None,
        }
    };
    if sub.reminder_sent(kind) {
        None
    } else {
        Some(kind)
    }
}

/// Run one reminder pass. Returns how many reminders went out.
pub async fn run_reminder_check(
    store: &dyn SubscriptionStore,
    notifier: &WebhookNotifier,
    webhook_urls: &[String],
    now: DateTime<Utc>,
) -> Result<usize> {
    if webhook_urls.is_empty() {
        debug!("reminders: no webhook urls configured, skipping pass");
        return Ok(0);
    }

    let subs = store.active_subscriptions().await?;
    debug!(count = subs.len(), "reminders: checking active grants");

    let mut sent = 0;
    for sub in &subs {
        let kind = match due_reminder(sub, now) {
            Some(kind) => kind,
            None => continue,
        };

        let masked = feed::mask_token(&sub.token);
        let event = match kind {
            ReminderKind::Expired => {
                WebhookEvent::subscription_expired(&masked, sub.owner_id, sub.expires_at)
            }
            _ => WebhookEvent::subscription_expiring(
                &masked,
                sub.owner_id,
                feed::days_remaining(sub.expires_at, now),
                sub.expires_at,
            ),
        };

        if notifier.dispatch(webhook_urls, &event).await == 0 {
            warn!(
                subscription_id = sub.id,
                tier = kind.label(),
                "reminders: no delivery landed, will retry next pass"
            );
            continue;
        }

        if let Err(e) = store.mark_reminder_sent(sub.id, kind).await {
            warn!(subscription_id = sub.id, error = %e, "reminders: failed to mark tier sent");
            continue;
        }

        info!(
            subscription_id = sub.id,
            tier = kind.label(),
            "reminders: reminder sent"
        );
        sent += 1;
    }

    Ok(sent)
}

/// Spawn the hourly reminder task. Call this once at startup.
pub fn spawn(
    store: Arc<dyn SubscriptionStore>,
    notifier: WebhookNotifier,
    webhook_urls: Vec<String>,
) {
    tokio::spawn(async move {
        let mut interval = time::interval(StdDuration::from_secs(3600));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) =
                run_reminder_check(store.as_ref(), &notifier, &webhook_urls, Utc::now()).await
            {
                tracing::error!("reminder job failed: {}", e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sub_expiring_in(hours: i64) -> SubscriptionRow {
        SubscriptionRow {
            id: 1,
            owner_id: 7,
            name: "Main".into(),
            token: "aaaabbbbccccddddeeeeffff00001111".into(),
            expires_at: Utc::now() + Duration::hours(hours),
            device_limit: 5,
            is_test: false,
            is_active: true,
            reminder_7d_at: None,
            reminder_3d_at: None,
            reminder_1d_at: None,
            expired_notice_at: None,
            created_at: Utc::now() - Duration::days(30),
        }
    }

    #[test]
    fn tiers_map_to_days_left() {
        let now = Utc::now();
        assert_eq!(
            due_reminder(&sub_expiring_in(6 * 24), now),
            Some(ReminderKind::SevenDays)
        );
        assert_eq!(
            due_reminder(&sub_expiring_in(60), now),
            Some(ReminderKind::ThreeDays)
        );
        assert_eq!(
            due_reminder(&sub_expiring_in(12), now),
            Some(ReminderKind::OneDay)
        );
        assert_eq!(
            due_reminder(&sub_expiring_in(-2), now),
            Some(ReminderKind::Expired)
        );
        assert_eq!(due_reminder(&sub_expiring_in(20 * 24), now), None);
    }

    #[test]
    fn sent_tier_does_not_repeat() {
        let now = Utc::now();
        let mut sub = sub_expiring_in(60);
        sub.reminder_3d_at = Some(now - Duration::hours(5));
        assert_eq!(due_reminder(&sub, now), None);
    }

    #[test]
    fn only_the_current_tier_fires() {
        // Down to one day left with no earlier reminders: the one-day tier
        // fires alone, earlier tiers are not back-filled.
        let now = Utc::now();
        assert_eq!(
            due_reminder(&sub_expiring_in(20), now),
            Some(ReminderKind::OneDay)
        );
    }
}
