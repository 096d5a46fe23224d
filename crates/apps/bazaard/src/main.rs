//! Bazaard - Marketplace mirror sync daemon
//!
//! Usage:
//!   bazaard                        run sweeps and serve webhooks
//!   bazaard sweep                  run a single sweep and exit
//!   bazaard authorize USER CODE    exchange an authorization code for USER

use anyhow::{Context, Result};
use log::{error, info, warn};
use market::{
    Clock, HttpMarketplaceApi, MarketCredentials, MarketStore, MarketplaceApi, OAuthClient,
    SqliteMarketStore, SyncScheduler, SyncSettings, SystemClock, TokenRefresher, UserId,
    WebhookDispatcher,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod listener;

enum Command {
    Serve,
    Sweep,
    Authorize { user_id: String, code: String },
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [] => Ok(Command::Serve),
        [cmd] if cmd == "sweep" => Ok(Command::Sweep),
        [cmd, user_id, code] if cmd == "authorize" => Ok(Command::Authorize {
            user_id: user_id.clone(),
            code: code.clone(),
        }),
        _ => anyhow::bail!("usage: bazaard [sweep | authorize USER_ID CODE]"),
    }
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let command = parse_args(args)?;
    let settings = SyncSettings::load()?;

    let credentials = match MarketCredentials::load() {
        Ok(creds) => creds,
        Err(e) => {
            if let Some(path) = MarketCredentials::default_credentials_path() {
                warn!(
                    "To configure marketplace access, either:\n\
                     1. Place your OAuth application credentials at: {}\n\
                     2. Or set environment variables: MARKET_CLIENT_ID and MARKET_CLIENT_SECRET",
                    path.display()
                );
            }
            return Err(e.context("Marketplace credentials not found"));
        }
    };

    let db_path = settings
        .database_path()
        .context("No database path: set database_path or BAZAAR_CONFIG_DIR")?;
    let store: Arc<dyn MarketStore> = Arc::new(SqliteMarketStore::open(&db_path)?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let endpoint = Arc::new(OAuthClient::new(
        settings.token_url.clone(),
        credentials.client_id.clone(),
        credentials.client_secret.clone(),
        settings.http_timeout(),
    ));
    let api: Arc<dyn MarketplaceApi> = Arc::new(HttpMarketplaceApi::new(
        &settings.api_base_url,
        settings.http_timeout(),
    )?);
    let refresher = Arc::new(
        TokenRefresher::new(store, endpoint, clock).with_read_margin(settings.read_renew_margin()),
    );
    let scheduler = SyncScheduler::new(Arc::clone(&refresher), Arc::clone(&api), settings.clone())?;

    match command {
        Command::Authorize { user_id, code } => {
            let redirect_uri = credentials
                .redirect_uri
                .as_deref()
                .context("MARKET_REDIRECT_URI is required to exchange a code")?;
            let user_id = UserId::new(user_id);
            let record = scheduler.onboard(&user_id, &code, redirect_uri)?;
            info!("Authorized user {}; token expires at {}", user_id, record.expires_at());
            Ok(())
        }
        Command::Sweep => {
            scheduler.recover_stale_runs()?;
            let report = scheduler.sweep();
            info!(
                "Sweep finished: {} submitted, {} completed, {} abandoned",
                report.submitted.len(),
                report.completed.len(),
                report.abandoned.len()
            );
            Ok(())
        }
        Command::Serve => {
            scheduler.recover_stale_runs()?;

            let dispatcher = Arc::new(WebhookDispatcher::new(refresher, api, &settings));
            let shutdown = Arc::new(AtomicBool::new(false));
            let sweeper = {
                let shutdown = Arc::clone(&shutdown);
                std::thread::Builder::new()
                    .name("sweeper".to_string())
                    .spawn(move || scheduler.run_until(&shutdown))
                    .context("Failed to spawn sweep loop")?
            };

            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            let served = runtime.block_on(async {
                let tcp = tokio::net::TcpListener::bind(&settings.webhook_bind_addr)
                    .await
                    .with_context(|| format!("Failed to bind {}", settings.webhook_bind_addr))?;
                info!("Listening for webhooks on {}", settings.webhook_bind_addr);
                listener::serve(tcp, dispatcher, shutdown_signal())
                    .await
                    .context("Webhook listener failed")
            });

            // The sweep loop exits once its current sweep is done
            shutdown.store(true, Ordering::Relaxed);
            if sweeper.join().is_err() {
                error!("Sweep loop panicked");
            }
            served
        }
    }
}

/// Resolves on Ctrl+C
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert!(matches!(parse_args(&args(&[])), Ok(Command::Serve)));
        assert!(matches!(parse_args(&args(&["sweep"])), Ok(Command::Sweep)));
        match parse_args(&args(&["authorize", "42", "TG-abc"])) {
            Ok(Command::Authorize { user_id, code }) => {
                assert_eq!(user_id, "42");
                assert_eq!(code, "TG-abc");
            }
            _ => panic!("expected authorize"),
        }
        assert!(parse_args(&args(&["authorize", "42"])).is_err());
        assert!(parse_args(&args(&["bogus"])).is_err());
    }
}
