//! Claude rotation proxy
//!
//! Single-binary reverse proxy that multiplexes Anthropic/OpenAI-format API
//! requests across a pool of OAuth accounts:
//! 1. Open the SQLite store, migrate any legacy accounts.json
//! 2. Load the rotation pool and start the token-refresh scheduler
//! 3. Serve the rotation-enabled endpoints, status, and health
//! 4. On SIGINT/SIGTERM: drain connections, stop the scheduler (5 s grace),
//!    close the store

mod config;
#[allow(dead_code)]
mod error;
mod forward;
mod metrics;
mod rotation;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use claude_pool::{Pool, RefreshConfig, RefreshScheduler, Refresher};
use claude_store::{Store, migrate_from_accounts_json};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::forward::Forwarder;
use crate::rotation::AppState;

/// Exit codes: 0 normal, 1 configuration error, 2 persistence init error,
/// 3 no accounts available at startup with `require_accounts` set.
const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_NO_ACCOUNTS: i32 = 3;

#[tokio::main]
async fn main() {
    // JSON logs with LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let code = run().await;
    if code != 0 {
        std::process::exit(code);
    }
}

async fn run() -> i32 {
    info!("starting claude-rotation-proxy");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str);

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load configuration");
            return EXIT_CONFIG;
        }
    };

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.upstream.base_url,
        data_dir = %config.rotation.data_dir.display(),
        refresh_lead_secs = config.rotation.refresh_lead_secs,
        max_attempts = config.rotation.max_attempts,
        "configuration loaded"
    );

    let store = match Store::open(&config.db_path()).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to initialize store");
            return EXIT_STORE;
        }
    };

    match migrate_from_accounts_json(&store, &config.legacy_accounts_path()).await {
        Ok(0) => {}
        Ok(migrated) => info!(migrated, "migrated accounts from legacy file"),
        Err(e) => warn!(error = %e, "legacy migration failed, continuing with stored accounts"),
    }

    let pool = match Pool::load(store.clone()).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!(error = %e, "failed to load account pool");
            return EXIT_STORE;
        }
    };

    if pool.is_empty().await {
        if config.rotation.require_accounts {
            error!("no accounts in store and require_accounts is set");
            return EXIT_NO_ACCOUNTS;
        }
        warn!("no accounts loaded; rotation endpoints return 503 until accounts are added");
    }

    let refresher = Arc::new(Refresher::new(
        Arc::clone(&pool),
        claude_auth::oauth_http_client(),
    ));
    let scheduler = RefreshScheduler::spawn(
        Arc::clone(&refresher),
        RefreshConfig {
            lead: Duration::from_secs(config.rotation.refresh_lead_secs),
            ..RefreshConfig::default()
        },
    );

    let forwarder = match Forwarder::new(
        &config.upstream.base_url,
        config.upstream.connect_timeout(),
        config.upstream.request_timeout(),
    ) {
        Ok(forwarder) => Arc::new(forwarder),
        Err(e) => {
            error!(error = %e, "failed to build upstream client");
            scheduler.stop().await;
            store.close().await;
            return EXIT_CONFIG;
        }
    };

    let app = routes::build_router(
        AppState {
            pool,
            refresher,
            forwarder,
            max_attempts: config.rotation.max_attempts,
        },
        metrics::install_recorder(),
    );

    let result = serve(&config, app).await;

    // Shutdown in reverse of startup: scheduler (bounded grace) before the
    // store so late refreshes still commit.
    scheduler.stop().await;
    store.close().await;

    match result {
        Ok(()) => {
            info!("shutdown complete");
            0
        }
        Err(e) => {
            error!(error = %e, "server error");
            EXIT_CONFIG
        }
    }
}

async fn serve(config: &Config, app: Router) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    info!(addr = %config.server.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
