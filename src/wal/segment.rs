//! Segment files: numbered, append-only files named `%08d` inside a WAL
//! directory. Readers skip anything that does not parse as a segment name.

use crate::wal::error::{WalError, WalResult};
use crate::wal::record::{decode_frame, Decoded, Record};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub index: u32,
    pub file_size: u64,
}

impl PartialOrd for SegmentInfo {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentInfo {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

pub fn segment_filename(index: u32) -> String {
    format!("{index:08}")
}

pub fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(segment_filename(index))
}

/// Returns `None` unless the name is exactly eight decimal digits.
pub fn parse_segment_filename(name: &str) -> Option<u32> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// All segments in `dir` in ascending index order. A missing directory has
/// no segments.
pub fn list_segments(dir: &Path) -> WalResult<Vec<SegmentInfo>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(WalError::Io(e)),
    };

    let mut segments = Vec::new();
    for dir_entry in read_dir {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        let Some(index) = parse_segment_filename(&file_name.to_string_lossy()) else {
            continue;
        };
        let metadata = dir_entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        segments.push(SegmentInfo {
            path: dir_entry.path(),
            index,
            file_size: metadata.len(),
        });
    }

    segments.sort();
    Ok(segments)
}

/// Read every usable record from a closed segment.
///
/// Corrupted frames are logged and skipped; a frame with an impossible
/// length or a truncated tail ends the read.
pub fn read_segment(path: &Path) -> WalResult<Vec<Record>> {
    let data = fs::read(path)?;
    let segment = path.display().to_string();
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        match decode_frame(&data[offset..]) {
            Decoded::Record { record, len } => {
                records.push(record);
                offset += len;
            }
            Decoded::Skipped { error, len } => {
                warn!(%segment, offset, error = %error, "Skipping unreadable WAL record");
                offset += len;
            }
            Decoded::Incomplete => {
                warn!(
                    %segment,
                    offset,
                    remaining = data.len() - offset,
                    "Truncated record at end of WAL segment"
                );
                break;
            }
            Decoded::Invalid(error) => {
                warn!(%segment, offset, error = %error, "Stopping WAL segment read");
                break;
            }
        }
    }

    debug!(%segment, records = records.len(), "Read WAL segment");
    Ok(records)
}
