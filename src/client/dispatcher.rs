use crate::api::Entry;
use crate::client::batch::Batch;
use crate::client::metrics::Metrics;
use crate::client::sender::SendBatch;
use crate::client::tenant::EntryProcessor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Batching limits of a dispatcher
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub batch_wait: Duration,
    pub batch_size: usize,
    pub max_streams: usize,
}

impl DispatchSettings {
    /// How often open batches are checked for age
    pub fn tick_interval(&self) -> Duration {
        (self.batch_wait / 10).max(MIN_TICK)
    }
}

/// Groups entries into per-tenant batches and sends them when they fill up
/// or get old. Returns after the input closes and the open batches are sent.
pub async fn run_dispatcher(
    mut input: mpsc::Receiver<Entry>,
    sender: Arc<dyn SendBatch>,
    tenants: EntryProcessor,
    settings: DispatchSettings,
    metrics: Arc<Metrics>,
    host: String,
) {
    let mut batches: HashMap<String, Batch> = HashMap::new();
    let mut ticker = tokio::time::interval(settings.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(host = %host, "Dispatcher started");

    loop {
        tokio::select! {
            result = input.recv() => {
                let Some(entry) = result else {
                    break;
                };
                let tenant = tenants.tenant_of(&entry);

                let batch = batches
                    .entry(tenant.clone())
                    .or_insert_with(|| Batch::new(settings.max_streams));
                if !batch.is_empty() && batch.size_bytes_after(&entry) > settings.batch_size {
                    let full = std::mem::replace(batch, Batch::new(settings.max_streams));
                    let _ = sender.send_batch(&tenant, full).await;
                }

                if let Err(e) = batch.add(entry) {
                    error!(host = %host, tenant = %tenant, error = %e, "Batch add err");
                    metrics.dropped_entries.with_label_values(&[host.as_str()]).inc();
                    break;
                }
            }
            _ = ticker.tick() => {
                let expired: Vec<String> = batches
                    .iter()
                    .filter(|(_, batch)| batch.age() >= settings.batch_wait)
                    .map(|(tenant, _)| tenant.clone())
                    .collect();
                for tenant in expired {
                    if let Some(batch) = batches.remove(&tenant) {
                        debug!(host = %host, tenant = %tenant, entries = batch.entry_count(), "Max wait time reached, sending batch");
                        let _ = sender.send_batch(&tenant, batch).await;
                    }
                }
            }
        }
    }

    for (tenant, batch) in batches.drain() {
        if !batch.is_empty() {
            let _ = sender.send_batch(&tenant, batch).await;
        }
    }
    info!(host = %host, "Dispatcher stopped");
}
