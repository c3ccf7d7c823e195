//! Push request wire format: protobuf messages, snappy block-compressed.

use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use thiserror::Error;

pub const CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("snappy error: {0}")]
    Snappy(#[from] snap::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Clone, PartialEq, Message)]
pub struct PushRequest {
    #[prost(message, repeated, tag = "1")]
    pub streams: Vec<StreamAdapter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamAdapter {
    #[prost(string, tag = "1")]
    pub labels: String,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<EntryAdapter>,
    #[prost(uint64, tag = "3")]
    pub hash: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntryAdapter {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "2")]
    pub line: String,
}

impl EntryAdapter {
    pub fn new(timestamp: DateTime<Utc>, line: String) -> Self {
        Self {
            timestamp: Some(prost_types::Timestamp {
                seconds: timestamp.timestamp(),
                nanos: timestamp.timestamp_subsec_nanos() as i32,
            }),
            line,
        }
    }

    /// Timestamp as a UTC datetime; missing or out-of-range values map to the epoch.
    pub fn datetime(&self) -> DateTime<Utc> {
        self.timestamp
            .as_ref()
            .and_then(|ts| Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single())
            .unwrap_or_default()
    }
}

/// Serializes and compresses a push request.
pub fn encode_push_request(request: &PushRequest) -> Result<Vec<u8>, ProtoError> {
    let raw = request.encode_to_vec();
    Ok(snap::raw::Encoder::new().compress_vec(&raw)?)
}

/// Inverse of [`encode_push_request`].
pub fn decode_push_request(body: &[u8]) -> Result<PushRequest, ProtoError> {
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(PushRequest::decode(raw.as_slice())?)
}
