//! Subgate — subscription feed server for proxied endpoints.
//!
//! Resolves grant tokens into client-ready connection URI feeds, caches
//! rendered bodies with TTL + LRU bounds, and runs the lifecycle jobs
//! (traffic anomaly scan, expiry reminders, sample retention).

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod feed;
pub mod jobs;
pub mod notification;
pub mod store;
pub mod uri;

use std::sync::Arc;

use cache::TtlLruCache;
use config::Config;
use feed::CachedFeed;
use notification::webhook::WebhookNotifier;
use store::SubscriptionStore;

/// Shared application state passed to handlers and jobs.
pub struct AppState {
    pub store: Arc<dyn SubscriptionStore>,
    pub cache: TtlLruCache<CachedFeed>,
    pub notifier: WebhookNotifier,
    pub config: Config,
}
