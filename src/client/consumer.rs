use crate::api::{Entry, LabelSet};
use crate::client::batch::Batch;
use crate::client::sender::SendBatch;
use crate::wal::{SegmentDeleter, WalConsumer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Turns one tenant's WAL records back into batches and sends them when their
/// segment is finished. A segment larger than `batch_size` is sent as several
/// batches.
pub struct ClientConsumer {
    tenant: String,
    series: HashMap<u64, LabelSet>,
    batch: Batch,
    /// Batches of the current segment that reached `batch_size`
    full: Vec<Batch>,
    batch_size: usize,
    max_streams: usize,
    sender: Arc<dyn SendBatch>,
    deleter: Arc<dyn SegmentDeleter>,
}

impl ClientConsumer {
    pub fn new(
        tenant: String,
        batch_size: usize,
        max_streams: usize,
        sender: Arc<dyn SendBatch>,
        deleter: Arc<dyn SegmentDeleter>,
    ) -> Self {
        Self {
            tenant,
            series: HashMap::new(),
            batch: Batch::new(max_streams),
            full: Vec::new(),
            batch_size,
            max_streams,
            sender,
            deleter,
        }
    }

    fn delete(&self, segment: u32) {
        if let Err(e) = self.deleter.delete_segment(segment) {
            error!(tenant = %self.tenant, segment, error = %e, "Failed to delete WAL segment");
        }
    }
}

#[async_trait]
impl WalConsumer for ClientConsumer {
    fn consume_series(&mut self, ref_id: u64, labels: LabelSet) {
        self.series.insert(ref_id, labels);
    }

    fn consume_entries(&mut self, ref_id: u64, entries: Vec<(DateTime<Utc>, String)>) {
        let Some(labels) = self.series.get(&ref_id) else {
            debug!(tenant = %self.tenant, ref_id, "Entries for unknown series, skipping");
            return;
        };
        for (timestamp, line) in entries {
            let entry = Entry::new(labels.clone(), timestamp, line);
            if !self.batch.is_empty() && self.batch.size_bytes_after(&entry) > self.batch_size {
                let full = std::mem::replace(&mut self.batch, Batch::new(self.max_streams));
                self.full.push(full);
            }
            self.batch.replay(entry);
        }
    }

    async fn segment_end(&mut self, segment: u32) {
        let last = std::mem::replace(&mut self.batch, Batch::new(self.max_streams));
        let mut batches = std::mem::take(&mut self.full);
        if !last.is_empty() {
            batches.push(last);
        }

        let mut failed = 0;
        for batch in batches {
            if let Err(e) = self.sender.send_batch(&self.tenant, batch).await {
                warn!(tenant = %self.tenant, segment, error = %e, "Failed to send WAL batch");
                failed += 1;
            }
        }

        if failed == 0 {
            self.delete(segment);
        } else {
            warn!(tenant = %self.tenant, segment, failed, "Keeping WAL segment after failed send");
        }
    }
}
