//! Tidings: real-time notification delivery with offline queueing.
//!
//! # Usage
//!
//! ```bash
//! tidings --port 8080 --data-dir ./data --follow alice=AAPL,MSFT
//! ```
//!
//! Environment variables can also be used:
//! - `TIDINGS_PORT`: Port to listen on
//! - `TIDINGS_DATA_DIR`: Data directory for SQLite
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::Context;
use std::fs;
use tidings::config::{Config, StorageBackend};
use tidings::observability::metrics::init_metrics_with_endpoint;
use tidings::observability::tracing::init_tracing;
use tidings::server::run_server;
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    let replay = if config.unordered_replay {
        "unordered"
    } else {
        "ordered"
    };
    eprintln!(
        r#"
   _   _     _ _
  | |_(_) __| (_)_ __   __ _ ___
  | __| |/ _` | | '_ \ / _` / __|
  | |_| | (_| | | | | | (_| \__ \
   \__|_|\__,_|_|_| |_|\__, |___/
                       |___/

  Tidings v{} - Notification Delivery

  Configuration:
    Address:    {}:{}
    Storage:    {:?} ({})
    Replay:     {}
    Supersede:  {:?}
    Log Level:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.host,
        config.port,
        config.storage,
        config.data_dir.display(),
        replay,
        config.supersede,
        config.log_level
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    // Initialize tracing/logging
    init_tracing(&config.log_level);

    // Initialize metrics (with optional OTLP export)
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    if config.storage == StorageBackend::Sqlite {
        fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;
    }

    print_banner(&config);

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    run_server(config, shutdown_rx).await?;

    tracing::info!("Tidings shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler; Ctrl+C only");
                if let Err(e) = ctrl_c.await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }
}
