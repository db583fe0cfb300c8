//! Market Feed Binary
//!
//! Runs the price feed with a health and price HTTP endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-feed
//! ```
//!
//! # Environment Variables
//!
//! - `MARKET_FEED_MODE`: stream | poll (default: stream)
//! - `MARKET_FEED_SYMBOLS`: comma-separated base symbols (default: BTC,ETH,ADA,SOL,DOT,AVAX)
//! - `MARKET_FEED_QUOTE_ASSET`: quote asset (default: USDT)
//! - `MARKET_FEED_HEALTH_PORT`: health HTTP port (default: 8083)
//! - `OTEL_ENABLED`: export spans over OTLP (default: false)
//! - `RUST_LOG`: log filter (default: `market_feed=info`)
//!
//! See `FeedConfig::from_env` for the full list.

use std::sync::Arc;

use anyhow::Context;
use market_feed::infrastructure::telemetry;
use market_feed::{FeedConfig, HealthServer, HealthServerState, MarketFeed, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting market feed");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = FeedConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let health_port = config.server.health_port;

    let feed = MarketFeed::new(config).context("failed to build market feed")?;

    let _status = feed.subscribe_to_status(|event| {
        if event.retries_exhausted() {
            tracing::error!(cause = ?event.cause, "Price stream gave up reconnecting");
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        feed.clone(),
    ));
    let health_server = HealthServer::new(health_port, health_state, shutdown_token.clone());

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    feed.start()?;

    tracing::info!("Market feed ready");

    await_shutdown(shutdown_token).await;
    feed.stop();

    tracing::info!("Market feed stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    tracing::info!(
        mode = config.mode.as_str(),
        symbols = ?config.symbols,
        quote_asset = %config.quote_asset,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.stream.url,
        rest_url = %config.poll.rest_url,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
