use crate::api::LabelSet;
use crate::wal::error::WalResult;
use crate::wal::record::{decode_frame, Decoded, Record};
use crate::wal::segment::{list_segments, segment_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives the records of a WAL in write order.
#[async_trait]
pub trait WalConsumer: Send {
    fn consume_series(&mut self, ref_id: u64, labels: LabelSet);

    fn consume_entries(&mut self, ref_id: u64, entries: Vec<(DateTime<Utc>, String)>);

    /// Every record of `segment` has been delivered.
    async fn segment_end(&mut self, segment: u32);
}

#[async_trait]
pub trait Stoppable {
    async fn stop(&self);
}

/// Tails one WAL directory on a background task.
pub struct WalWatcher {
    dir: PathBuf,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WalWatcher {
    /// Start reading at segment `first_segment`; older segments are ignored.
    pub fn start<C>(dir: PathBuf, first_segment: u32, poll_interval: Duration, consumer: C) -> Self
    where
        C: WalConsumer + 'static,
    {
        let shutdown = CancellationToken::new();
        let mut tail = SegmentTail::new(dir.clone(), first_segment);
        let task_shutdown = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut consumer = consumer;
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(dir = %tail.dir.display(), segment = tail.segment, "WAL watcher started");

            loop {
                tokio::select! {
                    biased;
                    _ = task_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = tail.poll(&mut consumer, false).await {
                            warn!(dir = %tail.dir.display(), error = %e, "Failed to read WAL");
                        }
                    }
                }
            }

            if let Err(e) = tail.poll(&mut consumer, true).await {
                error!(dir = %tail.dir.display(), error = %e, "Failed to drain WAL");
            }
            debug!(dir = %tail.dir.display(), "WAL watcher stopped");
        });

        Self {
            dir,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl Stoppable for WalWatcher {
    /// Deliver everything left on disk, ending every remaining segment, then
    /// halt the task. The WAL should be closed first so no new data arrives.
    async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(dir = %self.dir.display(), error = %e, "WAL watcher task failed");
            }
            info!(dir = %self.dir.display(), "WAL watcher drained");
        }
    }
}

/// Read position within the segment being tailed.
struct SegmentTail {
    dir: PathBuf,
    segment: u32,
    offset: u64,
    pending: Vec<u8>,
    /// Set once a frame with an impossible header was seen
    broken: bool,
}

impl SegmentTail {
    fn new(dir: PathBuf, segment: u32) -> Self {
        Self {
            dir,
            segment,
            offset: 0,
            pending: Vec::new(),
            broken: false,
        }
    }

    /// Deliver new records. A segment is finished once a newer segment
    /// exists, or unconditionally when `draining`.
    async fn poll<C: WalConsumer>(&mut self, consumer: &mut C, draining: bool) -> WalResult<()> {
        loop {
            // List before reading so that a newer segment seen here means the
            // read below observes the complete current segment.
            let newer = list_segments(&self.dir)?
                .into_iter()
                .map(|s| s.index)
                .find(|index| *index > self.segment);

            let exists = self.read_available(consumer)?;
            if newer.is_none() && !draining {
                return Ok(());
            }

            if !self.pending.is_empty() && !self.broken {
                warn!(
                    dir = %self.dir.display(),
                    segment = self.segment,
                    bytes = self.pending.len(),
                    "Discarding truncated record at end of WAL segment"
                );
            }
            if exists {
                consumer.segment_end(self.segment).await;
            }

            match newer {
                Some(next) => self.advance(next),
                None => return Ok(()),
            }
        }
    }

    /// Returns false when the segment file does not exist.
    fn read_available<C: WalConsumer>(&mut self, consumer: &mut C) -> WalResult<bool> {
        let mut file = match std::fs::File::open(segment_path(&self.dir, self.segment)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if self.broken {
            return Ok(true);
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let read = file.read_to_end(&mut self.pending)?;
        self.offset += read as u64;

        let mut consumed = 0usize;
        while consumed < self.pending.len() {
            match decode_frame(&self.pending[consumed..]) {
                Decoded::Record { record, len } => {
                    consumed += len;
                    match record {
                        Record::Series { ref_id, labels } => consumer.consume_series(ref_id, labels),
                        Record::Entries { ref_id, entries } => {
                            consumer.consume_entries(ref_id, entries)
                        }
                    }
                }
                Decoded::Skipped { error, len } => {
                    warn!(
                        dir = %self.dir.display(),
                        segment = self.segment,
                        error = %error,
                        "Skipping unreadable WAL record"
                    );
                    consumed += len;
                }
                Decoded::Incomplete => break,
                Decoded::Invalid(error) => {
                    warn!(
                        dir = %self.dir.display(),
                        segment = self.segment,
                        error = %error,
                        "Ignoring rest of WAL segment"
                    );
                    self.broken = true;
                    self.pending.clear();
                    return Ok(true);
                }
            }
        }
        self.pending.drain(..consumed);
        Ok(true)
    }

    fn advance(&mut self, next: u32) {
        self.segment = next;
        self.offset = 0;
        self.pending.clear();
        self.broken = false;
    }
}
