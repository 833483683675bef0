//! Herald notification delivery service.
//!
//! Main entry point. Loads configuration, starts the delivery engine and
//! feeds it requests read from standard input until a shutdown signal
//! arrives.

mod config;
mod intake;

use std::sync::Arc;

use anyhow::{Context, Result};
use config::Config;
use herald_core::time::RealClock;
use herald_delivery::{client::BotApiTransport, NotificationService};
use tokio::io::BufReader;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log);

    info!("Starting herald notification service");
    info!(
        bot_token = %config.bot_token_masked(),
        bot_api_url = %config.bot_api_url,
        queue_capacity = config.queue_capacity,
        batch_size = config.batch_size,
        rate_limit_per_minute = config.rate_limit_per_minute,
        rate_limit_per_hour = config.rate_limit_per_hour,
        "Configuration loaded"
    );

    let transport = BotApiTransport::new(config.to_client_config()?)
        .context("Failed to create bot API transport")?;

    let service = Arc::new(NotificationService::new(
        Arc::new(transport),
        config.to_service_config(),
        Arc::new(RealClock::new()),
    ));
    service.start().await.context("Failed to start notification service")?;

    let intake_handle = tokio::spawn({
        let service = service.clone();
        async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = intake::run(stdin, &service).await {
                error!(error = %format!("{e:#}"), "Request intake failed");
            }
        }
    });

    info!("Herald is ready to accept notifications on stdin");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    intake_handle.abort();

    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "Notification service did not stop cleanly");
    }

    let stats = service.stats().await;
    info!(
        total_sent = stats.total_sent,
        total_failed = stats.total_failed,
        total_cancelled = stats.total_cancelled,
        queue_size = stats.queue_size,
        "Herald shutdown complete"
    );
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
