pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};

pub use parse::{load_config, parse_config, ConfigError};
pub use types::{
    BackoffConfig, ClientConfig, Config, LimitsConfig, OptionsConfig, WalConfig, WatcherConfig,
};

const ENV_VAR_PATTERN: &str = r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    let Ok(re) = Regex::new(ENV_VAR_PATTERN) else {
        return text.to_string();
    };

    re.replace_all(text, |caps: &regex::Captures| {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        caps.get(1)
            .and_then(|name| std::env::var(name.as_str()).ok())
            .unwrap_or_else(|| whole.to_string())
    })
    .to_string()
}

/// Names of `$env{...}` references still present in `text`, sorted and deduplicated
pub fn unexpanded_env_vars(text: &str) -> Vec<String> {
    let Ok(re) = Regex::new(ENV_VAR_PATTERN) else {
        return Vec::new();
    };
    let mut names: Vec<String> = re
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Expands tilde (~) in paths to the user's home directory.
/// Returns the path unchanged if it doesn't start with tilde or home directory cannot be determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path based on explicit argument or default locations.
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/logship/config.yml
/// 3. /etc/logship/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/logship/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/logship/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_expand_env_vars_single() {
        std::env::set_var("LOGSHIP_TEST_VAR", "test_value");
        let result = expand_env_vars("path/$env{LOGSHIP_TEST_VAR}/file");
        assert_eq!(result, "path/test_value/file");
        std::env::remove_var("LOGSHIP_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_multiple() {
        std::env::set_var("LOGSHIP_VAR1", "value1");
        std::env::set_var("LOGSHIP_VAR2", "value2");
        let result = expand_env_vars("$env{LOGSHIP_VAR1}/middle/$env{LOGSHIP_VAR2}");
        assert_eq!(result, "value1/middle/value2");
        std::env::remove_var("LOGSHIP_VAR1");
        std::env::remove_var("LOGSHIP_VAR2");
    }

    #[test]
    fn test_expand_env_vars_unset() {
        let result = expand_env_vars("path/$env{LOGSHIP_NONEXISTENT_VAR}/file");
        // Unset variables are left unchanged
        assert_eq!(result, "path/$env{LOGSHIP_NONEXISTENT_VAR}/file");
    }

    #[test]
    fn test_expand_env_vars_ignores_plain_braces() {
        let result = expand_env_vars("${host}:${port}");
        assert_eq!(result, "${host}:${port}");
    }

    #[test]
    fn test_unexpanded_env_vars_dedup() {
        let names = unexpanded_env_vars("$env{B} $env{A} $env{B}");
        assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_expand_tilde_with_path() {
        let expanded = expand_tilde(Path::new("~/test/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("test/path"));
        }
    }

    #[test]
    fn test_expand_tilde_alone() {
        let expanded = expand_tilde(Path::new("~"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home);
        }
    }

    #[test]
    fn test_expand_tilde_no_expansion() {
        assert_eq!(
            expand_tilde(Path::new("/absolute/path")),
            Path::new("/absolute/path")
        );
        assert_eq!(
            expand_tilde(Path::new("relative/path")),
            Path::new("relative/path")
        );
    }
}
