//! Timepost time-event delivery service.
//!
//! Loads configuration, opens the dedup store, builds the handler and
//! transport, then runs the controller until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use timepost::{Config, Controller, LoggingHandler};
use timepost_core::{DedupStore, Handler, RealClock, SqliteDedupStore};
use timepost_delivery::{ForwardingHandler, HttpRemoteClient, RemoteClient};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("starting timepost");

    let config = Config::load()?;
    info!(
        transport = ?config.transport,
        remote = %config.remote_base_url,
        database_url = %config.database_url,
        batch_limit = config.batch_limit,
        "configuration loaded"
    );

    let store: Arc<dyn DedupStore> = Arc::new(connect_store(&config).await?);
    info!("dedup store ready");

    let remote: Arc<dyn RemoteClient> = Arc::new(
        HttpRemoteClient::new(config.to_client_config()).context("failed to build remote client")?,
    );

    let handler: Arc<dyn Handler> = match &config.forward_url {
        Some(url) => {
            info!(url = %url, "forwarding events");
            Arc::new(
                ForwardingHandler::new(url.clone(), Duration::from_secs(config.forward_timeout_seconds))
                    .context("failed to build forwarding handler")?,
            )
        },
        None => {
            warn!("no forward_url configured, events are only logged");
            Arc::new(LoggingHandler)
        },
    };

    let controller = Arc::new(Controller::from_config(&config, store, remote, handler)?);

    tokio::spawn({
        let controller = controller.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, starting graceful shutdown");
            controller.request_stop();
        }
    });

    let outcome = controller.start().await;
    controller.stop().await;
    outcome?;

    info!("timepost shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,timepost=debug,tower_http=debug"))
        .context("invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Opens the dedup store, retrying while the database is unavailable.
async fn connect_store(config: &Config) -> Result<SqliteDedupStore> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match SqliteDedupStore::connect(
            &config.database_url,
            config.database_max_connections,
            Arc::new(RealClock::new()),
        )
        .await
        {
            Ok(store) => return Ok(store),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "dedup store connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => return Err(e).context("failed to open dedup store after retries"),
        }
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
