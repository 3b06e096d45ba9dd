use crate::jobs::traffic_scan::ScanConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Public base URL clients reach this service at, used when printing
    /// subscription links. Set via SUBGATE_BASE_URL.
    pub base_url: String,
    /// Response cache TTL in seconds. Set via SUBGATE_CACHE_TTL. Default: 300.
    pub cache_ttl_secs: u64,
    /// Response cache capacity in entries. Set via SUBGATE_CACHE_SIZE. Default: 1000.
    pub cache_max_size: usize,
    /// Comma-separated list of webhook URLs to notify on scan and expiry events.
    pub webhook_urls: Vec<String>,
    /// Shared secret for webhook body signatures. Unsigned delivery when unset.
    pub webhook_secret: Option<String>,
    /// Lifetime of trial grants in hours. Set via SUBGATE_TEST_HOURS. Default: 48.
    pub test_grant_hours: i64,
    pub scan: ScanConfig,
    /// Hours between anomaly scans. Set via SUBGATE_SCAN_INTERVAL_HOURS. Default: 24.
    pub scan_interval_hours: u64,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    Ok(Config {
        port: env_parse("SUBGATE_PORT", 8080),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/subgate".into()),
        base_url: std::env::var("SUBGATE_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".into()),
        cache_ttl_secs: env_parse("SUBGATE_CACHE_TTL", 300),
        cache_max_size: env_parse("SUBGATE_CACHE_SIZE", 1000),
        webhook_urls: std::env::var("SUBGATE_WEBHOOK_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        webhook_secret: std::env::var("SUBGATE_WEBHOOK_SECRET").ok(),
        test_grant_hours: env_parse("SUBGATE_TEST_HOURS", 48),
        scan: scan_config_from_env(),
        scan_interval_hours: env_parse("SUBGATE_SCAN_INTERVAL_HOURS", 24),
    })
}

fn scan_config_from_env() -> ScanConfig {
    let defaults = ScanConfig::default();
    ScanConfig {
        window_days: env_parse("SUBGATE_SCAN_WINDOW_DAYS", defaults.window_days),
        download_limit_bytes: env_parse("SUBGATE_SCAN_DOWNLOAD_LIMIT_GB", 500u64)
            * 1024
            * 1024
            * 1024,
        ratio_threshold: env_parse("SUBGATE_SCAN_RATIO_THRESHOLD", defaults.ratio_threshold),
        ratio_min_upload_bytes: env_parse("SUBGATE_SCAN_RATIO_MIN_UPLOAD_GB", 10u64)
            * 1024
            * 1024
            * 1024,
        spike_multiplier: env_parse("SUBGATE_SCAN_SPIKE_MULTIPLIER", defaults.spike_multiplier),
        spike_min_history_days: env_parse(
            "SUBGATE_SCAN_MIN_HISTORY_DAYS",
            defaults.spike_min_history_days,
        ),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
