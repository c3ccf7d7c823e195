use crate::api::{labels_to_string, Entry, LabelSet, RESERVED_LABEL_TENANT_ID};
use crate::logproto::{encode_push_request, EntryAdapter, ProtoError, PushRequest, StreamAdapter};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("streams limit exceeded, streams: {streams} exceeds limit: {limit}, stream: '{stream}'")]
    StreamLimitExceeded {
        streams: usize,
        limit: usize,
        stream: String,
    },

    #[error("failed to encode batch: {0}")]
    Encode(#[from] ProtoError),
}

/// Entries sharing one label set, in the order they were added
#[derive(Debug, Clone)]
pub struct Stream {
    pub labels: LabelSet,
    pub entries: Vec<(DateTime<Utc>, String)>,
}

impl Stream {
    /// Timestamp of the most recently added entry
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|(ts, _)| *ts)
    }
}

/// Size- and age-bounded accumulation of entries for one tenant.
///
/// Streams are keyed by their label string without the reserved tenant label,
/// so an entry routed by `__tenant_id__` lands in the same stream as its
/// siblings once the tenant is resolved.
#[derive(Debug)]
pub struct Batch {
    streams: BTreeMap<String, Stream>,
    bytes: usize,
    created_at: Instant,
    max_streams: usize,
}

impl Batch {
    /// `max_streams == 0` disables the stream ceiling.
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            bytes: 0,
            created_at: Instant::now(),
            max_streams,
        }
    }

    /// Add an entry from live traffic, enforcing the stream ceiling
    pub fn add(&mut self, entry: Entry) -> Result<(), BatchError> {
        let key = labels_to_string(&entry.labels, Some(RESERVED_LABEL_TENANT_ID));
        if let Some(stream) = self.streams.get_mut(&key) {
            self.bytes += entry.line.len();
            stream.entries.push((entry.timestamp, entry.line));
            return Ok(());
        }

        let streams = self.streams.len();
        if self.max_streams > 0 && streams >= self.max_streams {
            return Err(BatchError::StreamLimitExceeded {
                streams,
                limit: self.max_streams,
                stream: key,
            });
        }

        self.insert_stream(key, entry);
        Ok(())
    }

    /// Add an entry that is already durable in the WAL; never rejected
    pub fn replay(&mut self, entry: Entry) {
        let key = labels_to_string(&entry.labels, Some(RESERVED_LABEL_TENANT_ID));
        match self.streams.get_mut(&key) {
            Some(stream) => {
                self.bytes += entry.line.len();
                stream.entries.push((entry.timestamp, entry.line));
            }
            None => self.insert_stream(key, entry),
        }
    }

    fn insert_stream(&mut self, key: String, entry: Entry) {
        self.bytes += entry.line.len();
        let mut labels = entry.labels;
        labels.remove(RESERVED_LABEL_TENANT_ID);
        self.streams.insert(
            key,
            Stream {
                labels,
                entries: vec![(entry.timestamp, entry.line)],
            },
        );
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    /// Size the batch would have after adding `entry`
    pub fn size_bytes_after(&self, entry: &Entry) -> usize {
        self.bytes + entry.line.len()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn entry_count(&self) -> usize {
        self.streams.values().map(|s| s.entries.len()).sum()
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    /// Encode to a compressed push request, returning the body and entry count
    pub fn encode(&self) -> Result<(Vec<u8>, usize), BatchError> {
        let (request, entries_count) = self.create_push_request();
        let buf = encode_push_request(&request)?;
        Ok((buf, entries_count))
    }

    fn create_push_request(&self) -> (PushRequest, usize) {
        let mut entries_count = 0;
        let streams = self
            .streams
            .iter()
            .map(|(labels, stream)| {
                entries_count += stream.entries.len();
                StreamAdapter {
                    labels: labels.clone(),
                    entries: stream
                        .entries
                        .iter()
                        .map(|(ts, line)| EntryAdapter::new(*ts, line.clone()))
                        .collect(),
                    hash: 0,
                }
            })
            .collect();
        (PushRequest { streams }, entries_count)
    }
}
