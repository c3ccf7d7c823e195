//! WAL record encoding.
//!
//! Every record is written as one frame:
//!
//! ```text
//! [u32 LE payload length][u32 LE crc32(payload)][payload]
//! ```
//!
//! The payload starts with a type byte (`1` series, `2` entries) followed by
//! the series reference as `u64 LE`. Strings are `u32 LE` length-prefixed
//! UTF-8, timestamps are `i64 LE` unix nanoseconds.

use crate::api::LabelSet;
use crate::wal::error::{WalError, WalResult};
use chrono::{DateTime, TimeZone, Utc};

/// Upper bound on a single frame payload (64 MiB).
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Bytes preceding the payload in a frame.
pub const FRAME_HEADER_SIZE: usize = 8;

const RECORD_SERIES: u8 = 1;
const RECORD_ENTRIES: u8 = 2;
const MIN_PAYLOAD_SIZE: usize = 1 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Binds a reference number to a label set for the rest of the segment
    Series { ref_id: u64, labels: LabelSet },
    /// Entries belonging to a previously declared series
    Entries {
        ref_id: u64,
        entries: Vec<(DateTime<Utc>, String)>,
    },
}

impl Record {
    /// Serialize into a complete frame. Fails for records a reader would
    /// refuse: payloads over [`MAX_RECORD_SIZE`] and timestamps outside the
    /// nanosecond range.
    pub fn encode(&self) -> WalResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(64);
        match self {
            Record::Series { ref_id, labels } => {
                payload.push(RECORD_SERIES);
                payload.extend_from_slice(&ref_id.to_le_bytes());
                put_len(&mut payload, labels.len());
                for (name, value) in labels {
                    put_str(&mut payload, name);
                    put_str(&mut payload, value);
                }
            }
            Record::Entries { ref_id, entries } => {
                payload.push(RECORD_ENTRIES);
                payload.extend_from_slice(&ref_id.to_le_bytes());
                put_len(&mut payload, entries.len());
                for (timestamp, line) in entries {
                    let nanos = timestamp
                        .timestamp_nanos_opt()
                        .ok_or(WalError::TimestampOutOfRange(*timestamp))?;
                    payload.extend_from_slice(&nanos.to_le_bytes());
                    put_str(&mut payload, line);
                }
            }
        }

        let length = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_SIZE)
            .ok_or(WalError::RecordTooLarge {
                length: payload.len(),
                max_length: MAX_RECORD_SIZE,
            })?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn decode_payload(payload: &[u8]) -> WalResult<Record> {
        let mut cursor = Cursor { buf: payload, pos: 0 };
        let kind = cursor.u8()?;
        let ref_id = cursor.u64()?;
        let record = match kind {
            RECORD_SERIES => {
                let count = cursor.u32()? as usize;
                let mut labels = LabelSet::new();
                for _ in 0..count {
                    let name = cursor.string()?;
                    let value = cursor.string()?;
                    labels.insert(name, value);
                }
                Record::Series { ref_id, labels }
            }
            RECORD_ENTRIES => {
                let count = cursor.u32()? as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let nanos = cursor.i64()?;
                    let line = cursor.string()?;
                    entries.push((Utc.timestamp_nanos(nanos), line));
                }
                Record::Entries { ref_id, entries }
            }
            other => return Err(WalError::UnknownRecordType(other)),
        };
        if cursor.pos != payload.len() {
            return Err(WalError::Malformed("trailing bytes after record"));
        }
        Ok(record)
    }
}

/// Outcome of decoding the frame at the start of a buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A valid record occupying `len` bytes
    Record { record: Record, len: usize },
    /// A complete frame whose contents could not be used; skip `len` bytes
    Skipped { error: WalError, len: usize },
    /// More bytes are needed to complete the frame
    Incomplete,
    /// The header cannot belong to a real frame; nothing after it can be trusted
    Invalid(WalError),
}

pub fn decode_frame(buf: &[u8]) -> Decoded {
    if buf.len() < FRAME_HEADER_SIZE {
        return Decoded::Incomplete;
    }
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if (length as usize) < MIN_PAYLOAD_SIZE || length > MAX_RECORD_SIZE {
        return Decoded::Invalid(WalError::InvalidLength {
            length,
            max_length: MAX_RECORD_SIZE,
        });
    }
    let expected = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    let end = FRAME_HEADER_SIZE + length as usize;
    if buf.len() < end {
        return Decoded::Incomplete;
    }

    let payload = &buf[FRAME_HEADER_SIZE..end];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Decoded::Skipped {
            error: WalError::CrcMismatch { expected, actual },
            len: end,
        };
    }

    match Record::decode_payload(payload) {
        Ok(record) => Decoded::Record { record, len: end },
        Err(error) => Decoded::Skipped { error, len: end },
    }
}

fn put_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> WalResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(WalError::Malformed("record body shorter than declared"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> WalResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> WalResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> WalResult<u64> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(arr))
    }

    fn i64(&mut self) -> WalResult<i64> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(arr))
    }

    fn string(&mut self) -> WalResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WalError::Malformed("invalid UTF-8 string"))
    }
}
