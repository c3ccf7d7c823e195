use crate::api::LabelSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stdin: StdinConfig,
}

/// Delivery settings for one push endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub url: String,
    /// Identity used for the WAL directory and the lag gauge; derived from
    /// the config when empty
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default = "default_batch_wait", with = "humantime_serde")]
    pub batch_wait: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub backoff_config: BackoffConfig,
    #[serde(default)]
    pub external_labels: LabelSet,
    #[serde(default)]
    pub wal: WalConfig,
    /// Deprecated: moved to `options.stream_lag_labels`, rejected when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_lag_labels: Option<Vec<String>>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: String::new(),
            tenant_id: String::new(),
            batch_wait: default_batch_wait(),
            batch_size: default_batch_size(),
            timeout: default_timeout(),
            backoff_config: BackoffConfig::default(),
            external_labels: LabelSet::new(),
            wal: WalConfig::default(),
            stream_lag_labels: None,
        }
    }
}

fn default_batch_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_size() -> usize {
    1024 * 1024
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_min_period", with = "humantime_serde")]
    pub min_period: Duration,
    #[serde(default = "default_max_period", with = "humantime_serde")]
    pub max_period: Duration,
    /// 0 retries forever (until cancelled or `max_elapsed`)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default, with = "humantime_serde")]
    pub max_elapsed: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_period: default_min_period(),
            max_period: default_max_period(),
            max_retries: default_max_retries(),
            max_elapsed: None,
        }
    }
}

fn default_min_period() -> Duration {
    Duration::from_millis(500)
}

fn default_max_period() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_retries() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wal_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_wal_dir(),
            max_segment_size: default_max_segment_size(),
            watcher: WatcherConfig::default(),
        }
    }
}

fn default_wal_dir() -> PathBuf {
    PathBuf::from("/var/lib/logship/wal")
}

fn default_max_segment_size() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum distinct streams per live batch, 0 for no limit
    #[serde(default)]
    pub max_streams: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// Stream labels copied onto the lag gauge
    #[serde(default)]
    pub stream_lag_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdinConfig {
    #[serde(default = "default_stdin_labels")]
    pub labels: LabelSet,
}

impl Default for StdinConfig {
    fn default() -> Self {
        Self {
            labels: default_stdin_labels(),
        }
    }
}

fn default_stdin_labels() -> LabelSet {
    LabelSet::from([("job".to_string(), "stdin".to_string())])
}
