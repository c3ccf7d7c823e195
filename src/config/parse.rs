use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parses and validates a config document after environment expansion
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    config.client.wal.dir = expand_tilde(&config.client.wal.dir);

    validate_config(&config)?;
    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let unexpanded_vars = unexpanded_env_vars(yaml_string);

    match unexpanded_vars.as_slice() {
        [] => Ok(()),
        [single] => Err(ConfigError::Validation(format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            single
        ))),
        many => Err(ConfigError::Validation(format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            many.join(", ")
        ))),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_client(&config.client, &mut errors);

    for name in &config.options.stream_lag_labels {
        if name.is_empty() {
            errors.push("options.stream_lag_labels: label names must not be empty".to_string());
        }
    }

    if let Some(listen) = &config.server.metrics_listen {
        if listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "server.metrics_listen: '{}' is not a socket address",
                listen
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

pub(crate) fn validate_client(client: &ClientConfig, errors: &mut Vec<String>) {
    if client.stream_lag_labels.is_some() {
        errors.push(
            "client.stream_lag_labels is deprecated, configure options.stream_lag_labels instead"
                .to_string(),
        );
    }

    if client.url.is_empty() {
        errors.push("client.url: must be set".to_string());
    } else {
        match reqwest::Url::parse(&client.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(format!(
                "client.url: unsupported scheme '{}' in '{}'",
                url.scheme(),
                client.url
            )),
            Err(e) => errors.push(format!("client.url: invalid URL '{}': {}", client.url, e)),
        }
    }

    if client.batch_wait.is_zero() {
        errors.push("client.batch_wait: must be greater than zero".to_string());
    }

    if client.batch_size == 0 {
        errors.push("client.batch_size: must be greater than zero".to_string());
    }

    let backoff = &client.backoff_config;
    if backoff.min_period > backoff.max_period {
        errors.push(format!(
            "client.backoff_config: min_period {:?} exceeds max_period {:?}",
            backoff.min_period, backoff.max_period
        ));
    }

    if client.wal.enabled {
        if client.wal.dir.as_os_str().is_empty() {
            errors.push("client.wal.dir: must be set when the WAL is enabled".to_string());
        }
        if client.wal.max_segment_size == 0 {
            errors.push("client.wal.max_segment_size: must be greater than zero".to_string());
        }
        if client.wal.watcher.poll_interval.is_zero() {
            errors.push("client.wal.watcher.poll_interval: must be greater than zero".to_string());
        }
    }
}
