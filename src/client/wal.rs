use crate::api::Entry;
use crate::client::consumer::ClientConsumer;
use crate::client::dispatcher::DispatchSettings;
use crate::client::replay::replay_all;
use crate::client::sender::SendBatch;
use crate::client::tenant::EntryProcessor;
use crate::config::types::WalConfig;
use crate::wal::{tenant_dir_name, Stoppable, Wal, WalError, WalWatcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Tenant WALs shared between the writer task and `Client::sync`
pub type SharedWals = Arc<Mutex<HashMap<String, Wal>>>;

/// One WAL plus watcher per tenant, created on first use.
pub struct WalSet {
    client_dir: PathBuf,
    config: WalConfig,
    batch_size: usize,
    max_streams: usize,
    wals: SharedWals,
    watchers: HashMap<String, WalWatcher>,
    sender: Arc<dyn SendBatch>,
    /// Entries that could not be written go straight to the dispatcher
    fallback: Option<mpsc::Sender<Entry>>,
}

impl WalSet {
    pub fn new(
        client_dir: PathBuf,
        config: WalConfig,
        batch_size: usize,
        max_streams: usize,
        sender: Arc<dyn SendBatch>,
        fallback: mpsc::Sender<Entry>,
    ) -> Self {
        Self {
            client_dir,
            config,
            batch_size,
            max_streams,
            wals: Arc::new(Mutex::new(HashMap::new())),
            watchers: HashMap::new(),
            sender,
            fallback: Some(fallback),
        }
    }

    pub fn shared(&self) -> SharedWals {
        self.wals.clone()
    }

    pub fn client_dir(&self) -> &PathBuf {
        &self.client_dir
    }

    /// Append to the tenant's WAL, or forward the entry undurably when that
    /// is impossible.
    pub async fn log_entry(&mut self, tenant: &str, entry: Entry) {
        let written = self
            .wal_for(tenant)
            .and_then(|wal| wal.log_entry(&entry));
        let Err(e) = written else {
            return;
        };

        warn!(tenant = %tenant, error = %e, "Failed to write entry to WAL, sending without it");
        if let Some(fallback) = &self.fallback {
            if fallback.send(entry).await.is_err() {
                warn!(tenant = %tenant, "Dispatcher is gone, dropping entry");
            }
        }
    }

    fn wal_for(&mut self, tenant: &str) -> Result<Wal, WalError> {
        if let Some(wal) = self.lock().get(tenant) {
            return Ok(wal.clone());
        }

        let dir_name =
            tenant_dir_name(tenant).ok_or_else(|| WalError::UnsafeTenant(tenant.to_string()))?;
        let wal = Wal::open(self.client_dir.join(dir_name), self.config.max_segment_size)?;

        let consumer = ClientConsumer::new(
            tenant.to_string(),
            self.batch_size,
            self.max_streams,
            self.sender.clone(),
            Arc::new(wal.clone()),
        );
        let watcher = WalWatcher::start(
            wal.dir().to_path_buf(),
            wal.head_segment(),
            self.config.watcher.poll_interval,
            consumer,
        );

        self.watchers.insert(tenant.to_string(), watcher);
        self.lock().insert(tenant.to_string(), wal.clone());
        debug!(tenant = %tenant, dir = %wal.dir().display(), "Created tenant WAL");
        Ok(wal)
    }

    /// Cut every head segment holding data older than `age`
    pub fn cut_aged(&self, age: std::time::Duration) {
        for (tenant, wal) in self.lock().iter() {
            if let Err(e) = wal.cut_if_older(age) {
                warn!(tenant = %tenant, error = %e, "Failed to cut WAL segment");
            }
        }
    }

    /// Close all WALs, drain their watchers and release the dispatcher.
    pub async fn stop(mut self) {
        let wals: Vec<(String, Wal)> = self.lock().drain().collect();
        for (tenant, wal) in &wals {
            if let Err(e) = wal.close() {
                warn!(tenant = %tenant, error = %e, "Failed to close WAL");
            }
        }
        for (_, watcher) in self.watchers.drain() {
            watcher.stop().await;
        }
        self.fallback = None;
        info!(dir = %self.client_dir.display(), tenants = wals.len(), "WAL set stopped");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Wal>> {
        self.wals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writer task: replays what a previous run left behind, then appends live
/// entries until the input closes.
pub async fn run_wal_writer(
    mut input: mpsc::Receiver<Entry>,
    mut wals: WalSet,
    tenants: EntryProcessor,
    settings: DispatchSettings,
) {
    replay_all(
        wals.client_dir(),
        wals.sender.as_ref(),
        settings.batch_size,
        settings.max_streams,
    )
    .await;

    let mut ticker = tokio::time::interval(settings.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = input.recv() => {
                let Some(entry) = result else {
                    break;
                };
                let tenant = tenants.tenant_of(&entry);
                wals.log_entry(&tenant, entry).await;
            }
            _ = ticker.tick() => wals.cut_aged(settings.batch_wait),
        }
    }

    wals.stop().await;
}
