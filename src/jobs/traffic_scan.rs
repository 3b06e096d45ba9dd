//! Traffic anomaly scanning job.
//!
//! This module provides a background task that periodically:
//! 1. Loads the trailing window of traffic samples.
//! 2. Aggregates per-key upload/download totals and a last-24h slice.
//! 3. Evaluates threshold rules against each key.
//! 4. Fires a webhook notification per flagged key.
//!
//! The job runs once a day by default. Scans never overlap: the run is
//! awaited inside the interval loop and missed ticks are skipped, not
//! bursted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::notification::webhook::{WebhookEvent, WebhookNotifier};
use crate::store::{SubscriptionStore, TrafficSampleRow};

const GIB: u64 = 1024 * 1024 * 1024;

/// Thresholds for the scan rules. Overridable through SUBGATE_SCAN_* vars.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Width of the trailing sample window, in days.
    pub window_days: i64,
    /// Rule 1: window download total above this flags the key.
    pub download_limit_bytes: u64,
    /// Rule 2: upload/download above this flags the key (when download > 0).
    pub ratio_threshold: f64,
    /// Rule 2 with zero download: upload alone must exceed this floor, so
    /// keepalive-only keys never flag.
    pub ratio_min_upload_bytes: u64,
    /// Rule 3: last-24h total above multiplier x the window daily average.
    pub spike_multiplier: f64,
    /// Rule 3 needs at least this many days of sample history; younger keys
    /// are skipped to keep first-use bursts from flagging.
    pub spike_min_history_days: i64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            download_limit_bytes: 500 * GIB,
            ratio_threshold: 0.5,
            ratio_min_upload_bytes: 10 * GIB,
            spike_multiplier: 10.0,
            spike_min_history_days: 7,
        }
    }
}

/// One triggered rule with the magnitudes that tripped it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleHit {
    ExcessiveDownload {
        download_bytes: i64,
        limit_bytes: u64,
    },
    UploadRatio {
        upload_bytes: i64,
        download_bytes: i64,
        /// Absent when download is zero.
        ratio: Option<f64>,
    },
    TrafficSpike {
        last_24h_bytes: i64,
        daily_avg_bytes: f64,
        multiplier: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyFlag {
    pub key_id: i64,
    pub hits: Vec<RuleHit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub scanned_keys: usize,
    pub flags: Vec<AnomalyFlag>,
    /// Webhook deliveries that were accepted.
    pub notified: usize,
}

/// Per-key aggregate over the window. Built from sums and minimums only,
/// so sample order (and mildly skewed recording clocks) cannot change it.
struct KeyWindow {
    upload: i64,
    download: i64,
    last24_total: i64,
    first_seen: DateTime<Utc>,
}

fn summarize(samples: &[TrafficSampleRow], now: DateTime<Utc>) -> BTreeMap<i64, KeyWindow> {
    let last24_cutoff = now - Duration::hours(24);
    let mut windows: BTreeMap<i64, KeyWindow> = BTreeMap::new();

    for sample in samples {
        let window = windows.entry(sample.key_id).or_insert_with(|| KeyWindow {
            upload: 0,
            download: 0,
            last24_total: 0,
            first_seen: sample.recorded_at,
        });
        window.upload += sample.upload_bytes;
        window.download += sample.download_bytes;
        if sample.recorded_at >= last24_cutoff {
            window.last24_total += sample.upload_bytes + sample.download_bytes;
        }
        if sample.recorded_at < window.first_seen {
            window.first_seen = sample.recorded_at;
        }
    }

    windows
}

fn evaluate(window: &KeyWindow, now: DateTime<Utc>, config: &ScanConfig) -> Vec<RuleHit> {
    let mut hits = Vec::new();

    // Keys with no traffic at all are never anomalous.
    if window.upload <= 0 && window.download <= 0 {
        return hits;
    }

    if window.download > config.download_limit_bytes as i64 {
        hits.push(RuleHit::ExcessiveDownload {
            download_bytes: window.download,
            limit_bytes: config.download_limit_bytes,
        });
    }

    if window.download > 0 {
        let ratio = window.upload as f64 / window.download as f64;
        if ratio > config.ratio_threshold {
            hits.push(RuleHit::UploadRatio {
                upload_bytes: window.upload,
                download_bytes: window.download,
                ratio: Some(ratio),
            });
        }
    } else if window.upload > config.ratio_min_upload_bytes as i64 {
        hits.push(RuleHit::UploadRatio {
            upload_bytes: window.upload,
            download_bytes: window.download,
            ratio: None,
        });
    }

    let history_days = (now - window.first_seen).num_seconds() as f64 / 86_400.0;
    if history_days >= config.spike_min_history_days as f64 {
        let daily_avg =
            (window.upload + window.download) as f64 / config.window_days.max(1) as f64;
        if daily_avg > 0.0
            && window.last24_total as f64 > config.spike_multiplier * daily_avg
        {
            hits.push(RuleHit::TrafficSpike {
                last_24h_bytes: window.last24_total,
                daily_avg_bytes: daily_avg,
                multiplier: config.spike_multiplier,
            });
        }
    }

    hits
}

/// Run one scan over the trailing window. Flags come back ordered by key id.
/// Also used directly by the `scan` CLI command.
pub async fn run_scan(
    store: &dyn SubscriptionStore,
    notifier: &WebhookNotifier,
    webhook_urls: &[String],
    config: &ScanConfig,
    now: DateTime<Utc>,
) -> Result<ScanReport> {
    let window_start = now - Duration::days(config.window_days);
    debug!(%window_start, window_end = %now, "traffic_scan: starting");

    let samples = store.samples_in_range(window_start, now).await?;
    let windows = summarize(&samples, now);
    let scanned_keys = windows.len();

    let mut flags = Vec::new();
    for (key_id, window) in &windows {
        let hits = evaluate(window, now, config);
        if !hits.is_empty() {
            warn!(
                key_id = *key_id,
                rules = hits.len(),
                "traffic_scan: anomalous key"
            );
            flags.push(AnomalyFlag {
                key_id: *key_id,
                hits,
            });
        }
    }

    let mut notified = 0;
    for flag in &flags {
        // One bad flag must not silence the rest of the run.
        let rules = match serde_json::to_value(&flag.hits) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(key_id = flag.key_id, error = %e, "traffic_scan: unserializable flag");
                continue;
            }
        };
        let event = WebhookEvent::traffic_anomaly(flag.key_id, rules);
        notified += notifier.dispatch(webhook_urls, &event).await;
    }

    info!(
        scanned_keys,
        flagged = flags.len(),
        notified,
        "traffic_scan: complete"
    );
    Ok(ScanReport {
        window_start,
        window_end: now,
        scanned_keys,
        flags,
        notified,
    })
}

/// Spawn the periodic scan task. Call this once at startup.
pub fn spawn(
    store: Arc<dyn SubscriptionStore>,
    notifier: WebhookNotifier,
    webhook_urls: Vec<String>,
    config: ScanConfig,
    interval_hours: u64,
) {
    tokio::spawn(async move {
        let mut interval = time::interval(StdDuration::from_secs(interval_hours.max(1) * 3600));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = run_scan(
                store.as_ref(),
                &notifier,
                &webhook_urls,
                &config,
                Utc::now(),
            )
            .await
            {
                tracing::error!("traffic scan failed: {}", e);
            }
        }
    });
}
