//! Configuration loader and validator for the consent engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub campaign: Campaign,
    pub directory: Directory,
    pub delivery: Delivery,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub evaluation_interval_secs: u64,
}

/// Consent and retry policy. None of these values come from the school; they
/// are defaults to be tuned per deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    pub consent_threshold: f64,
    pub max_delivery_attempts: i32,
    pub base_backoff_seconds: i64,
    pub max_backoff_seconds: i64,
}

/// Student directory service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Directory {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

/// Notification delivery webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub webhook_url: String,
    pub timeout_ms: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.campaign.max_delivery_attempts,
            base_backoff_secs: self.campaign.base_backoff_seconds,
            max_backoff_secs: self.campaign.max_backoff_seconds,
        }
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory.timeout_ms)
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }
}

/// Backoff and attempt ceiling for notification delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt` failures: base * 2^attempt,
    /// capped at `max_backoff_secs` (a non-positive cap disables capping).
    pub fn backoff_secs(&self, attempt: i32) -> i64 {
        let secs = self.base_backoff_secs * (1_i64 << attempt.clamp(0, 20));
        if self.max_backoff_secs <= 0 {
            secs
        } else {
            secs.min(self.max_backoff_secs)
        }
    }
}

const MAX_DIRECTORY_ATTEMPTS: u32 = 10;

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
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.evaluation_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "app.evaluation_interval_secs must be > 0",
        ));
    }

    let threshold = cfg.campaign.consent_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(ConfigError::Invalid(
            "campaign.consent_threshold must be in (0, 1]",
        ));
    }
    if cfg.campaign.max_delivery_attempts < 1 {
        return Err(ConfigError::Invalid(
            "campaign.max_delivery_attempts must be >= 1",
        ));
    }
    if cfg.campaign.base_backoff_seconds < 1 {
        return Err(ConfigError::Invalid(
            "campaign.base_backoff_seconds must be >= 1",
        ));
    }

    if cfg.directory.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("directory.base_url must be non-empty"));
    }
    if cfg.directory.timeout_ms == 0 {
        return Err(ConfigError::Invalid("directory.timeout_ms must be > 0"));
    }
    if cfg.directory.max_attempts == 0 || cfg.directory.max_attempts > MAX_DIRECTORY_ATTEMPTS {
        return Err(ConfigError::Invalid("directory.max_attempts must be in 1..=10"));
    }

    if cfg.delivery.webhook_url.trim().is_empty() {
        return Err(ConfigError::Invalid("delivery.webhook_url must be non-empty"));
    }
    if cfg.delivery.timeout_ms == 0 {
        return Err(ConfigError::Invalid("delivery.timeout_ms must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  evaluation_interval_secs: 60

campaign:
  consent_threshold: 0.8
  max_delivery_attempts: 5
  base_backoff_seconds: 5
  max_backoff_seconds: 3600

directory:
  base_url: "http://localhost:8081/"
  timeout_ms: 5000
  max_attempts: 3

delivery:
  webhook_url: "http://localhost:8082/notifications"
  timeout_ms: 5000
"#
}
