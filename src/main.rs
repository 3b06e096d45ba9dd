use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::RngCore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use subgate::cache::TtlLruCache;
use subgate::notification::webhook::WebhookNotifier;
use subgate::store::postgres::PgStore;
use subgate::store::{NewServer, NewSubscription, SubscriptionStore};
use subgate::{api, cli, config, feed, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "subgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Scan { window_days }) => run_scan_once(cfg, window_days).await,
        Some(cli::Commands::Grant { command }) => {
            let store = PgStore::connect(&cfg.database_url).await?;
            handle_grant_command(command, &store, &cfg).await
        }
        Some(cli::Commands::Server { command }) => {
            let store = PgStore::connect(&cfg.database_url).await?;
            handle_server_command(command, &store).await
        }
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: config::Config, port_override: Option<u16>) -> anyhow::Result<()> {
    let port = port_override.unwrap_or(cfg.port);

    tracing::info!("Connecting to database...");
    let store = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    store.migrate().await?;

    let store: Arc<dyn SubscriptionStore> = Arc::new(store);
    let cache = TtlLruCache::new(cfg.cache_max_size, Duration::from_secs(cfg.cache_ttl_secs));
    let notifier = WebhookNotifier::new(cfg.webhook_secret.clone());

    jobs::traffic_scan::spawn(
        store.clone(),
        notifier.clone(),
        cfg.webhook_urls.clone(),
        cfg.scan.clone(),
        cfg.scan_interval_hours,
    );
    jobs::reminders::spawn(store.clone(), notifier.clone(), cfg.webhook_urls.clone());
    jobs::cleanup::spawn(store.clone());
    tracing::info!("Background jobs started (anomaly scan, expiry reminders, sample retention)");

    let state = Arc::new(AppState {
        store,
        cache,
        notifier,
        config: cfg,
    });

    let app = api::router().with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Subgate listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// One immediate scan, printed instead of notified. Webhook delivery stays
/// with the background job so a manual run never double-fires alerts.
async fn run_scan_once(cfg: config::Config, window_days: i64) -> anyhow::Result<()> {
    let store = PgStore::connect(&cfg.database_url).await?;
    let notifier = WebhookNotifier::new(cfg.webhook_secret.clone());

    let mut scan_cfg = cfg.scan.clone();
    scan_cfg.window_days = window_days;

    let report =
        jobs::traffic_scan::run_scan(&store, &notifier, &[], &scan_cfg, chrono::Utc::now())
            .await?;

    println!(
        "Scanned {} keys between {} and {}.",
        report.scanned_keys,
        report.window_start.format("%Y-%m-%d %H:%M UTC"),
        report.window_end.format("%Y-%m-%d %H:%M UTC"),
    );
    if report.flags.is_empty() {
        println!("No anomalies flagged.");
    } else {
        for flag in &report.flags {
            println!(
                "key {:>6}: {}",
                flag.key_id,
                serde_json::to_string(&flag.hits)?
            );
        }
    }
    Ok(())
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn handle_grant_command(
    cmd: cli::GrantCommands,
    store: &PgStore,
    cfg: &config::Config,
) -> anyhow::Result<()> {
    match cmd {
        cli::GrantCommands::Create {
            owner,
            days,
            name,
            device_limit,
            test,
        } => {
            let token = generate_token();
            let expires_at = if test {
                chrono::Utc::now() + chrono::Duration::hours(cfg.test_grant_hours)
            } else {
                chrono::Utc::now() + chrono::Duration::days(days)
            };

            let sub = store
                .insert_subscription(&NewSubscription {
                    owner_id: owner,
                    name,
                    token: token.clone(),
                    expires_at,
                    device_limit,
                    is_test: test,
                })
                .await?;

            println!(
                "Grant created:\n  ID:      {}\n  Owner:   {}\n  Token:   {}\n  Expires: {}\n  URL:     {}/sub/{}",
                sub.id,
                sub.owner_id,
                token,
                sub.expires_at.format("%Y-%m-%d %H:%M UTC"),
                cfg.base_url.trim_end_matches('/'),
                token,
            );
        }
        cli::GrantCommands::List => {
            let subs = store.list_subscriptions().await?;
            if subs.is_empty() {
                println!("No grants found.");
            } else {
                println!(
                    "{:<6} {:<8} {:<18} {:<22} {:<8}",
                    "ID", "OWNER", "TOKEN", "EXPIRES", "ACTIVE"
                );
                for s in subs {
                    println!(
                        "{:<6} {:<8} {:<18} {:<22} {:<8}",
                        s.id,
                        s.owner_id,
                        feed::mask_token(&s.token),
                        s.expires_at.format("%Y-%m-%d %H:%M UTC"),
                        s.is_active
                    );
                }
            }
        }
        cli::GrantCommands::Revoke { token } => {
            let revoked = store.revoke_subscription(&token).await?;
            if revoked {
                println!("Grant revoked.");
            } else {
                println!("Grant not found or already revoked.");
            }
        }
    }
    Ok(())
}

async fn handle_server_command(cmd: cli::ServerCommands, store: &PgStore) -> anyhow::Result<()> {
    match cmd {
        cli::ServerCommands::Add {
            name,
            host,
            protocol,
            api_url,
            capacity,
        } => {
            let server = store
                .insert_server(&NewServer {
                    name,
                    host,
                    protocol,
                    api_url,
                    capacity,
                })
                .await?;
            println!(
                "Server created:\n  ID:   {}\n  Name: {}\n  Host: {}",
                server.id, server.name, server.host
            );
        }
        cli::ServerCommands::List => {
            let servers = store.list_servers().await?;
            if servers.is_empty() {
                println!("No servers found.");
            } else {
                println!(
                    "{:<6} {:<20} {:<30} {:<10} {:<8}",
                    "ID", "NAME", "HOST", "PROTOCOL", "ACTIVE"
                );
                for s in servers {
                    println!(
                        "{:<6} {:<20} {:<30} {:<10} {:<8}",
                        s.id, s.name, s.host, s.protocol, s.is_active
                    );
                }
            }
        }
    }
    Ok(())
}
