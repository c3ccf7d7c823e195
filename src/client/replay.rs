//! Sending data left in a client's WAL directory by a previous run.

use crate::api::{Entry, LabelSet};
use crate::client::batch::Batch;
use crate::client::sender::SendBatch;
use crate::wal::{list_segments, read_segment, tenant_from_dir_name, Record, WalResult};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// A tenant directory found under a client's WAL directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableTenant {
    pub tenant: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub batches_sent: usize,
    pub batches_failed: usize,
    pub segments_deleted: usize,
    pub segments_kept: usize,
}

/// Tenant subdirectories of `client_dir`, sorted by name. A missing
/// directory has nothing to recover.
pub fn recoverable_tenants(client_dir: &Path) -> WalResult<Vec<RecoverableTenant>> {
    let read_dir = match fs::read_dir(client_dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut tenants = Vec::new();
    for dir_entry in read_dir {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_dir() {
            continue;
        }
        let name = dir_entry.file_name().to_string_lossy().to_string();
        tenants.push(RecoverableTenant {
            tenant: tenant_from_dir_name(&name),
            dir: dir_entry.path(),
        });
    }
    tenants.sort_by(|a, b| a.dir.cmp(&b.dir));
    Ok(tenants)
}

/// Replay every tenant under `client_dir`.
pub async fn replay_all(
    client_dir: &Path,
    sender: &dyn SendBatch,
    batch_size: usize,
    max_streams: usize,
) -> ReplaySummary {
    let tenants = match recoverable_tenants(client_dir) {
        Ok(tenants) => tenants,
        Err(e) => {
            error!(dir = %client_dir.display(), error = %e, "Failed to scan WAL directory for replay");
            return ReplaySummary::default();
        }
    };

    let mut total = ReplaySummary::default();
    for tenant in &tenants {
        let summary = replay_tenant(tenant, sender, batch_size, max_streams).await;
        total.batches_sent += summary.batches_sent;
        total.batches_failed += summary.batches_failed;
        total.segments_deleted += summary.segments_deleted;
        total.segments_kept += summary.segments_kept;
    }
    if !tenants.is_empty() {
        info!(
            dir = %client_dir.display(),
            tenants = tenants.len(),
            batches_sent = total.batches_sent,
            batches_failed = total.batches_failed,
            "Replayed WAL"
        );
    }
    total
}

/// Send the contents of one tenant's segments in `batch_size` batches.
///
/// A segment is deleted once every batch holding its entries was sent;
/// segments touched by a failed batch stay for the next run.
pub async fn replay_tenant(
    tenant: &RecoverableTenant,
    sender: &dyn SendBatch,
    batch_size: usize,
    max_streams: usize,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    let segments = match list_segments(&tenant.dir) {
        Ok(segments) => segments,
        Err(e) => {
            error!(dir = %tenant.dir.display(), error = %e, "Failed to list WAL segments");
            return summary;
        }
    };

    let mut replay = TenantReplay {
        tenant: &tenant.tenant,
        sender,
        batch_size,
        max_streams,
        series: HashMap::new(),
        batch: Batch::new(max_streams),
        touched: BTreeSet::new(),
        failed: BTreeSet::new(),
        summary: &mut summary,
    };

    for segment in &segments {
        let records = match read_segment(&segment.path) {
            Ok(records) => records,
            Err(e) => {
                warn!(segment = %segment.path.display(), error = %e, "Failed to read WAL segment");
                replay.failed.insert(segment.index);
                continue;
            }
        };
        for record in records {
            replay.apply(segment.index, record).await;
        }
    }
    replay.flush().await;
    let failed = std::mem::take(&mut replay.failed);

    for segment in &segments {
        if failed.contains(&segment.index) {
            summary.segments_kept += 1;
            continue;
        }
        match fs::remove_file(&segment.path) {
            Ok(()) => summary.segments_deleted += 1,
            Err(e) => {
                error!(segment = %segment.path.display(), error = %e, "Failed to delete WAL segment");
                summary.segments_kept += 1;
            }
        }
    }

    debug!(tenant = %tenant.tenant, ?summary, "Replayed tenant WAL");
    summary
}

struct TenantReplay<'a> {
    tenant: &'a str,
    sender: &'a dyn SendBatch,
    batch_size: usize,
    max_streams: usize,
    series: HashMap<u64, LabelSet>,
    batch: Batch,
    /// Segments with entries in the current batch
    touched: BTreeSet<u32>,
    failed: BTreeSet<u32>,
    summary: &'a mut ReplaySummary,
}

impl TenantReplay<'_> {
    async fn apply(&mut self, segment: u32, record: Record) {
        match record {
            Record::Series { ref_id, labels } => {
                self.series.insert(ref_id, labels);
            }
            Record::Entries { ref_id, entries } => {
                let Some(labels) = self.series.get(&ref_id).cloned() else {
                    debug!(tenant = %self.tenant, segment, ref_id, "Entries for unknown series, skipping");
                    return;
                };
                for (timestamp, line) in entries {
                    let entry = Entry::new(labels.clone(), timestamp, line);
                    if !self.batch.is_empty() && self.batch.size_bytes_after(&entry) > self.batch_size {
                        self.flush().await;
                    }
                    self.batch.replay(entry);
                    self.touched.insert(segment);
                }
            }
        }
    }

    async fn flush(&mut self) {
        let batch = std::mem::replace(&mut self.batch, Batch::new(self.max_streams));
        let touched = std::mem::take(&mut self.touched);
        if batch.is_empty() {
            return;
        }
        match self.sender.send_batch(self.tenant, batch).await {
            Ok(()) => self.summary.batches_sent += 1,
            Err(_) => {
                self.summary.batches_failed += 1;
                self.failed.extend(touched);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::label_set;
    use crate::client::sender::SendError;
    use crate::wal::segment::segment_path;
    use crate::wal::Wal;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every batch; the `fail_on`-th call (1-based) fails
    struct FailNth {
        fail_on: usize,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl SendBatch for FailNth {
        async fn send_batch(&self, tenant_id: &str, batch: Batch) -> Result<(), SendError> {
            let lines = batch
                .streams()
                .flat_map(|s| s.entries.iter().map(|(_, line)| line.clone()))
                .collect();
            let mut calls = self.calls.lock().unwrap();
            calls.push((tenant_id.to_string(), lines));
            if calls.len() == self.fail_on {
                return Err(SendError::Status {
                    status: 500,
                    message: String::new(),
                });
            }
            Ok(())
        }
    }

    fn entry(line: &str) -> Entry {
        Entry::new(label_set([("job", "x")]), Utc.timestamp_opt(1, 0).unwrap(), line)
    }

    #[test]
    fn test_missing_client_dir_has_nothing_to_replay() {
        let dir = TempDir::new().unwrap();
        assert!(recoverable_tenants(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn test_recoverable_tenants_maps_default_dir() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("@default")).unwrap();
        fs::create_dir(dir.path().join("team-a")).unwrap();
        fs::write(dir.path().join("stray-file"), b"").unwrap();

        let tenants: Vec<String> = recoverable_tenants(dir.path())
            .unwrap()
            .into_iter()
            .map(|t| t.tenant)
            .collect();
        assert_eq!(tenants, vec!["".to_string(), "team-a".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_splits_by_size_and_keeps_failed_segments() {
        let dir = TempDir::new().unwrap();
        let tenant_dir = dir.path().join("team-a");
        let wal = Wal::open(&tenant_dir, 1024 * 1024).unwrap();
        for line in ["aaaa", "bbbb"] {
            wal.log_entry(&entry(line)).unwrap();
        }
        wal.cut().unwrap();
        for line in ["cccc", "dddd"] {
            wal.log_entry(&entry(line)).unwrap();
        }
        wal.close().unwrap();

        // Second batch ("cccc", "dddd") fails
        let sender = FailNth {
            fail_on: 2,
            calls: Mutex::new(Vec::new()),
        };
        let tenants = recoverable_tenants(dir.path()).unwrap();
        let summary = replay_tenant(&tenants[0], &sender, 8, 0).await;

        assert_eq!(
            *sender.calls.lock().unwrap(),
            vec![
                ("team-a".to_string(), vec!["aaaa".to_string(), "bbbb".to_string()]),
                ("team-a".to_string(), vec!["cccc".to_string(), "dddd".to_string()]),
            ]
        );
        assert_eq!(summary.batches_sent, 1);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(summary.segments_deleted, 1);
        assert_eq!(summary.segments_kept, 1);
        assert!(!segment_path(&tenant_dir, 0).exists());
        assert!(segment_path(&tenant_dir, 1).exists());
    }

    #[tokio::test]
    async fn test_replay_flushes_mid_record_without_dropping() {
        let dir = TempDir::new().unwrap();
        let tenant_dir = dir.path().join("@default");
        fs::create_dir_all(&tenant_dir).unwrap();
        let mut data = Record::Series {
            ref_id: 1,
            labels: label_set([("job", "x")]),
        }
        .encode().unwrap();
        data.extend(
            Record::Entries {
                ref_id: 1,
                entries: ["aaaa", "bbbb", "cccc"]
                    .iter()
                    .map(|line| (Utc.timestamp_opt(1, 0).unwrap(), line.to_string()))
                    .collect(),
            }
            .encode().unwrap(),
        );
        fs::write(segment_path(&tenant_dir, 0), data).unwrap();

        let sender = FailNth {
            fail_on: 0,
            calls: Mutex::new(Vec::new()),
        };
        let tenants = recoverable_tenants(dir.path()).unwrap();
        let summary = replay_tenant(&tenants[0], &sender, 4, 0).await;

        let lines: Vec<Vec<String>> = sender
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, lines)| lines.clone())
            .collect();
        assert_eq!(
            lines,
            vec![
                vec!["aaaa".to_string()],
                vec!["bbbb".to_string()],
                vec!["cccc".to_string()],
            ]
        );
        assert_eq!(summary.segments_deleted, 1);
    }
}
