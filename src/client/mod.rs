//! Batching delivery client for the push endpoint.
//!
//! Entries go through [`Client::handle`] into either the in-memory
//! [`dispatcher`] or, with the WAL enabled, a per-tenant write-ahead log that
//! is tailed by a [`consumer::ClientConsumer`]. Both paths end in
//! [`sender::Sender`].

pub mod backoff;
pub mod batch;
pub mod consumer;
pub mod dispatcher;
pub mod metrics;
pub mod replay;
pub mod sender;
pub mod tenant;
pub mod wal;

use crate::api::{Entry, LabelSet};
use crate::config::parse::validate_client;
use crate::config::types::ClientConfig;
use crate::wal::WalError;
use dispatcher::{run_dispatcher, DispatchSettings};
use metrics::Metrics;
use sender::{SendBatch, Sender};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, PoisonError};
use tenant::EntryProcessor;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wal::{run_wal_writer, SharedWals, WalSet};

pub const USER_AGENT: &str = concat!("logship/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client config: {0}")]
    Config(String),

    #[error("failed to serialize client config: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error("client is stopped")]
    Stopped,
}

/// Producer-facing handle: accepts entries and owns the background tasks
/// that deliver them.
pub struct Client {
    name: String,
    host: String,
    entries: Mutex<Option<mpsc::Sender<Entry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    wals: Option<SharedWals>,
    processor: EntryProcessor,
    metrics: Arc<Metrics>,
}

impl Client {
    /// Validate `config` and start the delivery tasks. Must be called
    /// within a tokio runtime.
    pub fn new(
        metrics: Arc<Metrics>,
        config: &ClientConfig,
        max_streams: usize,
    ) -> Result<Self, ClientError> {
        let mut problems = Vec::new();
        validate_client(config, &mut problems);
        if !problems.is_empty() {
            return Err(ClientError::Config(problems.join("; ")));
        }
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| ClientError::Config(format!("invalid URL '{}': {}", config.url, e)))?;
        let host = host_of(&url);

        let name = effective_name(config)?;

        let http = reqwest::Client::builder().build()?;
        let cancel = CancellationToken::new();
        let sender: Arc<dyn SendBatch> = Arc::new(Sender::new(
            http,
            config.url.clone(),
            host.clone(),
            name.clone(),
            config.timeout,
            config.backoff_config.clone(),
            metrics.clone(),
            cancel.clone(),
        ));

        metrics.init_host(&host);

        let processor = EntryProcessor::new(config.external_labels.clone(), config.tenant_id.clone());
        let settings = DispatchSettings {
            batch_wait: config.batch_wait,
            batch_size: config.batch_size,
            max_streams,
        };

        let (entries_tx, entries_rx) = mpsc::channel(1);
        let mut tasks = Vec::new();
        let mut wals = None;

        let dispatch_rx = if config.wal.enabled {
            let (fallback_tx, fallback_rx) = mpsc::channel(1);
            let set = WalSet::new(
                config.wal.dir.join(&name),
                config.wal.clone(),
                config.batch_size,
                max_streams,
                sender.clone(),
                fallback_tx,
            );
            wals = Some(set.shared());
            tasks.push(tokio::spawn(run_wal_writer(
                entries_rx,
                set,
                processor.clone(),
                settings,
            )));
            fallback_rx
        } else {
            entries_rx
        };

        tasks.push(tokio::spawn(run_dispatcher(
            dispatch_rx,
            sender,
            processor.clone(),
            settings,
            metrics.clone(),
            host.clone(),
        )));

        info!(client = %name, host = %host, wal = config.wal.enabled, "Client started");

        Ok(Self {
            name,
            host,
            entries: Mutex::new(Some(entries_tx)),
            tasks: Mutex::new(tasks),
            cancel,
            wals,
            processor,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host label of this client's metrics
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Submit one entry. Waits until the receiving loop accepts it.
    pub async fn handle(&self, entry: Entry) -> Result<(), ClientError> {
        let tx = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ClientError::Stopped)?;
        tx.send(self.processor.process(entry))
            .await
            .map_err(|_| ClientError::Stopped)
    }

    /// Stop accepting entries, deliver what is pending and wait for every
    /// background task. Safe to call more than once.
    pub async fn stop(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                error!(client = %self.name, error = %e, "Client task failed");
            }
        }
    }

    /// Like [`Client::stop`], but pending sends give up instead of retrying.
    pub async fn stop_now(&self) {
        self.cancel.cancel();
        self.stop().await;
    }

    /// Flush every tenant WAL to stable storage. A no-op without the WAL.
    pub fn sync(&self) -> Result<(), ClientError> {
        let Some(wals) = &self.wals else {
            return Ok(());
        };
        let wals = wals.lock().unwrap_or_else(PoisonError::into_inner);
        for wal in wals.values() {
            wal.sync()?;
        }
        Ok(())
    }

    /// Remove one `stream_lag_seconds` series. `host` and `client` default
    /// to this client's.
    pub fn unregister_latency_metric(&self, labels: &LabelSet) -> bool {
        let mut labels = labels.clone();
        labels
            .entry("host".to_string())
            .or_insert_with(|| self.host.clone());
        labels
            .entry("client".to_string())
            .or_insert_with(|| self.name.clone());
        self.metrics.remove_stream_lag(&labels)
    }
}

/// `host[:port]` as written in the URL
fn host_of(url: &reqwest::Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// The configured name, or one derived from the rest of the config
pub fn effective_name(config: &ClientConfig) -> Result<String, ClientError> {
    if config.name.is_empty() {
        derive_name(config)
    } else {
        Ok(config.name.clone())
    }
}

/// First six hex characters of the SHA-256 of the serialized config
fn derive_name(config: &ClientConfig) -> Result<String, ClientError> {
    let serialized = serde_yaml::to_string(config)?;
    let digest = Sha256::digest(serialized.as_bytes());
    let hex: String = digest.iter().take(3).map(|b| format!("{b:02x}")).collect();
    Ok(hex)
}
