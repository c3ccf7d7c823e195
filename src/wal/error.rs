use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum of a frame payload does not match its header.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Frame header declares a length no writer could have produced.
    #[error("frame declares length {length} bytes, outside 1..={max_length}")]
    InvalidLength { length: u32, max_length: u32 },

    #[error("record payload of {length} bytes exceeds the limit of {max_length}")]
    RecordTooLarge { length: usize, max_length: u32 },

    #[error("timestamp {0} cannot be stored as unix nanoseconds")]
    TimestampOutOfRange(DateTime<Utc>),

    #[error("unknown record type {0}")]
    UnknownRecordType(u8),

    #[error("malformed record: {0}")]
    Malformed(&'static str),

    #[error("tenant '{0}' cannot be used as a WAL directory name")]
    UnsafeTenant(String),

    #[error("segment {0:08} is the active head segment")]
    ActiveSegment(u32),

    #[error("WAL is closed")]
    Closed,
}

pub type WalResult<T> = Result<T, WalError>;
