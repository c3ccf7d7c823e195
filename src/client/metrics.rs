//! Prometheus collectors shared by every delivery path of a client.

use crate::api::LabelSet;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

const NAMESPACE: &str = "logship";
const HOST_LABEL: &str = "host";
const CLIENT_LABEL: &str = "client";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics text is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    pub encoded_bytes: IntCounterVec,
    pub sent_bytes: IntCounterVec,
    pub dropped_bytes: IntCounterVec,
    pub sent_entries: IntCounterVec,
    pub dropped_entries: IntCounterVec,
    pub request_duration: HistogramVec,
    pub batch_retries: IntCounterVec,
    pub stream_lag: GaugeVec,
    /// Stream labels copied onto `stream_lag`, after `host` and `client`
    lag_labels: Vec<String>,
}

impl Metrics {
    /// Build the collectors and register them with `registry` when given.
    pub fn new(registry: Option<&Registry>, stream_lag_labels: &[String]) -> Result<Self, MetricsError> {
        let counter = |name: &str, help: &str| {
            IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &[HOST_LABEL])
        };

        let mut lag_label_names = vec![HOST_LABEL, CLIENT_LABEL];
        lag_label_names.extend(stream_lag_labels.iter().map(String::as_str));

        let metrics = Self {
            encoded_bytes: counter("encoded_bytes_total", "Number of bytes encoded and ready to send.")?,
            sent_bytes: counter("sent_bytes_total", "Number of bytes sent.")?,
            dropped_bytes: counter(
                "dropped_bytes_total",
                "Number of bytes dropped because failed to be sent to the ingester after all retries.",
            )?,
            sent_entries: counter("sent_entries_total", "Number of log entries sent to the ingester.")?,
            dropped_entries: counter(
                "dropped_entries_total",
                "Number of log entries dropped because failed to be sent to the ingester after all retries.",
            )?,
            request_duration: HistogramVec::new(
                HistogramOpts::new("request_duration_seconds", "Duration of send requests.")
                    .namespace(NAMESPACE),
                &["status_code", HOST_LABEL],
            )?,
            batch_retries: counter("batch_retries_total", "Number of times batches has had to be retried.")?,
            stream_lag: GaugeVec::new(
                Opts::new("stream_lag_seconds", "Difference between current time and last batch timestamp for successful sends")
                    .namespace(NAMESPACE),
                &lag_label_names,
            )?,
            lag_labels: stream_lag_labels.to_vec(),
        };

        if let Some(registry) = registry {
            registry.register(Box::new(metrics.encoded_bytes.clone()))?;
            registry.register(Box::new(metrics.sent_bytes.clone()))?;
            registry.register(Box::new(metrics.dropped_bytes.clone()))?;
            registry.register(Box::new(metrics.sent_entries.clone()))?;
            registry.register(Box::new(metrics.dropped_entries.clone()))?;
            registry.register(Box::new(metrics.request_duration.clone()))?;
            registry.register(Box::new(metrics.batch_retries.clone()))?;
            registry.register(Box::new(metrics.stream_lag.clone()))?;
        }

        Ok(metrics)
    }

    /// Make the host's counters visible at zero before the first send
    pub fn init_host(&self, host: &str) {
        for counter in [
            &self.encoded_bytes,
            &self.sent_bytes,
            &self.dropped_bytes,
            &self.sent_entries,
            &self.dropped_entries,
            &self.batch_retries,
        ] {
            counter.with_label_values(&[host]).inc_by(0);
        }
    }

    pub fn lag_labels(&self) -> &[String] {
        &self.lag_labels
    }

    fn lag_values<'a>(&'a self, host: &'a str, client: &'a str, labels: &'a LabelSet) -> Vec<&'a str> {
        let mut values = vec![host, client];
        values.extend(
            self.lag_labels
                .iter()
                .map(|name| labels.get(name).map(String::as_str).unwrap_or("")),
        );
        values
    }

    pub fn set_stream_lag(&self, host: &str, client: &str, stream_labels: &LabelSet, seconds: f64) {
        let values = self.lag_values(host, client, stream_labels);
        self.stream_lag.with_label_values(&values).set(seconds);
    }

    /// Remove one lag series. `labels` carries `host`, `client` and the
    /// configured lag labels; absent names match the empty value.
    pub fn remove_stream_lag(&self, labels: &LabelSet) -> bool {
        let host = labels.get(HOST_LABEL).map(String::as_str).unwrap_or("");
        let client = labels.get(CLIENT_LABEL).map(String::as_str).unwrap_or("");
        let values = self.lag_values(host, client, labels);
        self.stream_lag.remove_label_values(&values).is_ok()
    }
}

/// Render a registry in the Prometheus text exposition format
pub fn render(registry: &Registry) -> Result<String, MetricsError> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::label_set;

    #[test]
    fn test_registered_counters_start_at_zero() {
        let registry = Registry::new();
        let metrics = Metrics::new(Some(&registry), &[]).unwrap();
        metrics.init_host("localhost:3100");

        let text = render(&registry).unwrap();
        assert!(text.contains(r#"logship_sent_bytes_total{host="localhost:3100"} 0"#));
        assert!(text.contains(r#"logship_dropped_entries_total{host="localhost:3100"} 0"#));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        Metrics::new(Some(&registry), &[]).unwrap();
        assert!(Metrics::new(Some(&registry), &[]).is_err());
    }

    #[test]
    fn test_stream_lag_uses_configured_labels() {
        let metrics = Metrics::new(None, &["filename".to_string()]).unwrap();
        let stream = label_set([("job", "x"), ("filename", "/var/log/a.log")]);
        metrics.set_stream_lag("h", "c", &stream, 1.5);

        let gauge = metrics
            .stream_lag
            .with_label_values(&["h", "c", "/var/log/a.log"]);
        assert_eq!(gauge.get(), 1.5);

        let series = label_set([("host", "h"), ("client", "c"), ("filename", "/var/log/a.log")]);
        assert!(metrics.remove_stream_lag(&series));
        assert!(!metrics.remove_stream_lag(&series));
    }

    #[test]
    fn test_missing_lag_label_is_empty() {
        let metrics = Metrics::new(None, &["filename".to_string()]).unwrap();
        metrics.set_stream_lag("h", "c", &label_set([("job", "x")]), 2.0);
        assert_eq!(metrics.stream_lag.with_label_values(&["h", "c", ""]).get(), 2.0);
    }
}
