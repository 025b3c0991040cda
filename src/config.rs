//! Configuration loader and validator for the republishing bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub publishing: Publishing,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub max_delivery_attempts: u32,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Empty list means every user is allowed.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
}

/// Scheduler settings: batch capacity and per-destination rate budgets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publishing {
    pub batch_capacity: usize,
    pub adhoc_limit: RateLimit,
    pub scheduled_limit: RateLimit,
}

/// A fixed-window rate budget with a block applied once exhausted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub max_points: i64,
    pub window_seconds: i64,
    pub block_seconds: i64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_delivery_attempts == 0 {
        return Err(ConfigError::Invalid(
            "app.max_delivery_attempts must be > 0",
        ));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    if cfg.publishing.batch_capacity == 0 {
        return Err(ConfigError::Invalid("publishing.batch_capacity must be > 0"));
    }
    validate_limit(&cfg.publishing.adhoc_limit)?;
    validate_limit(&cfg.publishing.scheduled_limit)?;

    Ok(())
}

fn validate_limit(limit: &RateLimit) -> Result<(), ConfigError> {
    if limit.max_points <= 0 {
        return Err(ConfigError::Invalid("rate limit max_points must be > 0"));
    }
    if limit.window_seconds <= 0 {
        return Err(ConfigError::Invalid("rate limit window_seconds must be > 0"));
    }
    if limit.block_seconds < 0 {
        return Err(ConfigError::Invalid("rate limit block_seconds must be >= 0"));
    }
    Ok(())
}

/// Example YAML document matching the schema.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 3600
  max_delivery_attempts: 5

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  allowed_users:
    - 123456789

publishing:
  batch_capacity: 10
  adhoc_limit:
    max_points: 10
    window_seconds: 60
    block_seconds: 60
  scheduled_limit:
    max_points: 15
    window_seconds: 60
    block_seconds: 60
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.publishing.batch_capacity, 10);
        assert_eq!(cfg.publishing.adhoc_limit.max_points, 10);
        assert_eq!(cfg.publishing.scheduled_limit.max_points, 15);
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_capacity() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publishing.batch_capacity = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publishing.adhoc_limit.max_points = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publishing.scheduled_limit.window_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.telegram.allowed_users, vec![123456789]);
    }
}
