use crate::client::backoff::Backoff;
use crate::client::batch::{Batch, BatchError};
use crate::client::metrics::Metrics;
use crate::config::types::BackoffConfig;
use crate::logproto;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Header carrying the tenant of a push request
pub const ORG_ID_HEADER: &str = "X-Scope-OrgID";

/// Bytes of an error response read for the error message
const MAX_ERROR_BODY: usize = 1024;

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] BatchError),

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned HTTP status {status}: {message}")]
    Status { status: u16, message: String },
}

impl SendError {
    /// 429, 5xx and transport failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Transport(_) => true,
            SendError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..=599).contains(status)
            }
            SendError::Encode(_) => false,
        }
    }

    /// Value of the `status_code` label; -1 when no response was received
    pub fn status_label(&self) -> String {
        match self {
            SendError::Status { status, .. } => status.to_string(),
            _ => "-1".to_string(),
        }
    }
}

/// Delivers one tenant batch, retrying as the backoff allows.
#[async_trait]
pub trait SendBatch: Send + Sync {
    async fn send_batch(&self, tenant_id: &str, batch: Batch) -> Result<(), SendError>;
}

/// HTTP sender for the push endpoint
pub struct Sender {
    client: reqwest::Client,
    url: String,
    host: String,
    client_name: String,
    user_agent: String,
    timeout: Duration,
    backoff: BackoffConfig,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Sender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        url: String,
        host: String,
        client_name: String,
        timeout: Duration,
        backoff: BackoffConfig,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            url,
            host,
            client_name,
            user_agent: crate::client::USER_AGENT.to_string(),
            timeout,
            backoff,
            metrics,
            cancel,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// One POST attempt
    async fn send(&self, tenant_id: &str, body: Vec<u8>) -> Result<u16, SendError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, logproto::CONTENT_TYPE)
            .header(USER_AGENT, &self.user_agent)
            .body(body);
        if !tenant_id.is_empty() {
            request = request.header(ORG_ID_HEADER, tenant_id);
        }

        let mut response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let mut body = Vec::new();
        while body.len() < MAX_ERROR_BODY {
            match response.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                _ => break,
            }
        }
        body.truncate(MAX_ERROR_BODY);
        let text = String::from_utf8_lossy(&body);
        let message = text.lines().next().unwrap_or("").to_string();

        Err(SendError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn record_lag(&self, batch: &Batch) {
        let now = Utc::now();
        for stream in batch.streams() {
            if let Some(last) = stream.last_timestamp() {
                let lag = (now - last).num_milliseconds() as f64 / 1000.0;
                self.metrics
                    .set_stream_lag(&self.host, &self.client_name, &stream.labels, lag);
            }
        }
    }
}

#[async_trait]
impl SendBatch for Sender {
    async fn send_batch(&self, tenant_id: &str, batch: Batch) -> Result<(), SendError> {
        let (body, entries_count) = match batch.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(host = %self.host, tenant = %tenant_id, error = %e, "Error encoding batch");
                return Err(e.into());
            }
        };
        let body_len = body.len() as u64;
        let host = self.host.as_str();
        self.metrics.encoded_bytes.with_label_values(&[host]).inc_by(body_len);

        let mut backoff = Backoff::new(&self.backoff, self.cancel.clone());
        let last_error = loop {
            let start = Instant::now();
            let result = self.send(tenant_id, body.clone()).await;
            let status_label = match &result {
                Ok(status) => status.to_string(),
                Err(e) => e.status_label(),
            };
            self.metrics
                .request_duration
                .with_label_values(&[status_label.as_str(), host])
                .observe(start.elapsed().as_secs_f64());

            let err = match result {
                Ok(_) => {
                    self.metrics.sent_bytes.with_label_values(&[host]).inc_by(body_len);
                    self.metrics
                        .sent_entries
                        .with_label_values(&[host])
                        .inc_by(entries_count as u64);
                    self.record_lag(&batch);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_retryable() || !backoff.ongoing() {
                break err;
            }

            warn!(
                host = %host,
                tenant = %tenant_id,
                status = %status_label,
                retries = backoff.num_retries(),
                error = %err,
                "Error sending batch, will retry"
            );
            self.metrics.batch_retries.with_label_values(&[host]).inc();
            backoff.wait().await;
            if !backoff.ongoing() {
                break err;
            }
        };

        error!(
            host = %host,
            tenant = %tenant_id,
            entries = entries_count,
            error = %last_error,
            "Final error sending batch"
        );
        self.metrics.dropped_bytes.with_label_values(&[host]).inc_by(body_len);
        self.metrics
            .dropped_entries
            .with_label_values(&[host])
            .inc_by(entries_count as u64);
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> SendError {
        SendError::Status {
            status: code,
            message: String::new(),
        }
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(302).is_retryable());
    }

    #[test]
    fn test_status_label() {
        assert_eq!(status(503).status_label(), "503");
    }
}
