use crate::api::{labels_to_string, Entry};
use crate::wal::error::{WalError, WalResult};
use crate::wal::record::Record;
use crate::wal::segment::{list_segments, segment_path};
use crate::wal::SegmentDeleter;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Append side of one tenant's write-ahead log.
///
/// Cloning yields another handle to the same log; the writer task appends
/// through one handle while the watcher's consumer deletes finished segments
/// and `Client::sync` flushes through others.
#[derive(Debug, Clone)]
pub struct Wal {
    dir: PathBuf,
    max_segment_size: u64,
    state: Arc<Mutex<WalState>>,
}

#[derive(Debug)]
struct WalState {
    file: Option<File>,
    head: u32,
    head_size: u64,
    head_started: Option<Instant>,
    /// Series written into the head segment, keyed by label string
    series: HashMap<String, u64>,
    next_ref: u64,
}

impl Wal {
    /// Open a fresh head segment after any segments already in `dir`.
    pub fn open(dir: impl AsRef<Path>, max_segment_size: u64) -> WalResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let head = match list_segments(&dir)?.last() {
            Some(last) => last.index + 1,
            None => 0,
        };
        let file = create_segment(&dir, head)?;
        info!(dir = %dir.display(), head, "Opened WAL");

        Ok(Self {
            dir,
            max_segment_size,
            state: Arc::new(Mutex::new(WalState {
                file: Some(file),
                head,
                head_size: 0,
                head_started: None,
                series: HashMap::new(),
                next_ref: 1,
            })),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Index of the segment currently being written
    pub fn head_segment(&self) -> u32 {
        self.lock().head
    }

    /// Append one entry, declaring its series first if the head segment has
    /// not seen it yet.
    pub fn log_entry(&self, entry: &Entry) -> WalResult<()> {
        let mut state = self.lock();
        if state.file.is_none() {
            return Err(WalError::Closed);
        }
        if state.head_size >= self.max_segment_size {
            self.cut_locked(&mut state)?;
        }

        let key = labels_to_string(&entry.labels, None);
        let known = state.series.get(&key).copied();
        let ref_id = known.unwrap_or(state.next_ref);

        let mut frame = Vec::new();
        if known.is_none() {
            frame.extend(
                Record::Series {
                    ref_id,
                    labels: entry.labels.clone(),
                }
                .encode()?,
            );
        }
        frame.extend(
            Record::Entries {
                ref_id,
                entries: vec![(entry.timestamp, entry.line.clone())],
            }
            .encode()?,
        );
        if known.is_none() {
            state.next_ref += 1;
            state.series.insert(key, ref_id);
        }

        let file = state.file.as_mut().ok_or(WalError::Closed)?;
        file.write_all(&frame)?;
        state.head_size += frame.len() as u64;
        if state.head_started.is_none() {
            state.head_started = Some(Instant::now());
        }
        Ok(())
    }

    /// Start a new head segment if the current one holds data older than `age`.
    pub fn cut_if_older(&self, age: Duration) -> WalResult<bool> {
        let mut state = self.lock();
        if state.file.is_none() {
            return Ok(false);
        }
        match state.head_started {
            Some(started) if started.elapsed() >= age => {
                self.cut_locked(&mut state)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Start a new head segment unless the current one is empty.
    pub fn cut(&self) -> WalResult<bool> {
        let mut state = self.lock();
        if state.file.is_none() || state.head_size == 0 {
            return Ok(false);
        }
        self.cut_locked(&mut state)?;
        Ok(true)
    }

    fn cut_locked(&self, state: &mut WalState) -> WalResult<()> {
        if let Some(file) = state.file.as_mut() {
            file.sync_data()?;
        }
        let next = state.head + 1;
        state.file = Some(create_segment(&self.dir, next)?);
        debug!(dir = %self.dir.display(), segment = next, "Cut WAL segment");
        state.head = next;
        state.head_size = 0;
        state.head_started = None;
        state.series.clear();
        Ok(())
    }

    /// Flush the head segment to stable storage
    pub fn sync(&self) -> WalResult<()> {
        match self.lock().file.as_mut() {
            Some(file) => Ok(file.sync_data()?),
            None => Ok(()),
        }
    }

    /// Sync and stop accepting entries; every segment becomes deletable.
    pub fn close(&self) -> WalResult<()> {
        let mut state = self.lock();
        if let Some(file) = state.file.take() {
            file.sync_data()?;
            info!(dir = %self.dir.display(), head = state.head, "Closed WAL");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().file.is_none()
    }

    fn lock(&self) -> MutexGuard<'_, WalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SegmentDeleter for Wal {
    fn delete_segment(&self, index: u32) -> WalResult<()> {
        {
            let state = self.lock();
            if state.file.is_some() && state.head == index {
                return Err(WalError::ActiveSegment(index));
            }
        }
        match fs::remove_file(segment_path(&self.dir, index)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WalError::Io(e)),
        }
    }
}

fn create_segment(dir: &Path, index: u32) -> WalResult<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment_path(dir, index))?)
}
