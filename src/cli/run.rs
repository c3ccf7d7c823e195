use crate::api::Entry;
use crate::client::metrics::{Metrics, MetricsError};
use crate::client::{Client, ClientError};
use crate::config::parse::load_config;
use crate::server::start_metrics_server;
use chrono::Utc;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("invalid metrics listen address '{addr}': {source}")]
    Listen {
        addr: String,
        source: std::net::AddrParseError,
    },
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/logship/config.yml");
            eprintln!("  /etc/logship/config.yml");
            eprintln!("\nUse --config <path> to specify a config file.");
            std::process::exit(1);
        }
    };

    run_shipper(&config_path).await.map_err(|e| e.into())
}

async fn run_shipper(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(Metrics::new(Some(&registry), &config.options.stream_lag_labels)?);
    let client = Arc::new(Client::new(metrics, &config.client, config.limits.max_streams)?);
    info!(client = %client.name(), host = %client.host(), "Client ready");

    let server_shutdown = CancellationToken::new();
    let server_handle = match &config.server.metrics_listen {
        Some(listen) => {
            let addr: SocketAddr = listen.parse().map_err(|source| RunError::Listen {
                addr: listen.clone(),
                source,
            })?;
            let shutdown = server_shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) =
                    start_metrics_server(addr, registry, async move { shutdown.cancelled().await }).await
                {
                    error!(error = %e, "Metrics server error");
                }
            }))
        }
        None => None,
    };

    let labels = config.stdin.labels.clone();
    let reader_client = client.clone();
    let mut reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let entry = Entry::new(labels.clone(), Utc::now(), line);
            if reader_client.handle(entry).await.is_err() {
                break;
            }
        }
        Ok::<(), std::io::Error>(())
    });

    tokio::select! {
        result = &mut reader => {
            match result {
                Ok(Ok(())) => info!("End of input, shutting down"),
                Ok(Err(e)) => error!(error = %e, "Failed to read input"),
                Err(e) => error!(error = %e, "Input task join error"),
            }
            client.stop().await;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, delivering pending entries (Ctrl+C again to abort retries)");
            let stop = client.stop();
            tokio::pin!(stop);
            tokio::select! {
                _ = &mut stop => {}
                _ = signal::ctrl_c() => {
                    warn!("Second shutdown signal, stopping without retries");
                    tokio::join!(&mut stop, client.stop_now());
                }
            }
            reader.abort();
        }
    }

    if let Err(e) = client.sync() {
        warn!(error = %e, "Failed to sync WAL");
    }

    server_shutdown.cancel();
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}
