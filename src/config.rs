//! `herald.toml`.
//!
//! Every section is optional; accessors fill in defaults so callers never
//! see a missing value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::attachments::{AttachmentPolicy, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_SIZE};
use crate::notifications::dispatcher::DEFAULT_TIMEOUT;
use crate::scheduler::job::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Parse(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: Option<DispatcherConfig>,
    #[serde(default)]
    pub attachments: Option<AttachmentsConfig>,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub http: Option<HttpConfig>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct DispatcherConfig {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AttachmentsConfig {
    pub max_size_bytes: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SchedulerConfig {
    pub enabled: Option<bool>,
    pub database_path: Option<String>,
    pub tick_interval_secs: Option<u64>,
    pub max_concurrent_jobs: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    pub claim_lease_secs: Option<u64>,
    pub default_max_attempts: Option<u32>,
    pub retry_base_secs: Option<u64>,
    pub retry_max_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info` or `herald=debug`.
    pub level: Option<String>,
    /// `json` or `pretty`.
    pub format: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct HttpConfig {
    /// Accept invalid TLS certificates (self-hosted test servers only).
    pub insecure_tls: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct DestinationConfig {
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// `./herald.toml`, then the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from("herald.toml");
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("herald").join("herald.toml"))
            .filter(|path| path.is_file())
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        self.dispatcher.clone().unwrap_or_default()
    }

    pub fn attachments(&self) -> AttachmentsConfig {
        self.attachments.clone().unwrap_or_default()
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        self.scheduler.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    pub fn http(&self) -> HttpConfig {
        self.http.clone().unwrap_or_default()
    }
}

impl DispatcherConfig {
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

impl AttachmentsConfig {
    pub fn policy(&self) -> AttachmentPolicy {
        AttachmentPolicy {
            max_size: self.max_size_bytes.unwrap_or(DEFAULT_MAX_SIZE),
            fetch_timeout: self
                .fetch_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_FETCH_TIMEOUT),
        }
    }
}

impl SchedulerConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn database_path(&self) -> Option<&str> {
        self.database_path.as_deref()
    }

    pub fn tick_interval_secs(&self) -> u64 {
        self.tick_interval_secs.unwrap_or(5).max(1)
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs.unwrap_or(4).max(1)
    }

    pub fn job_timeout_secs(&self) -> u64 {
        self.job_timeout_secs.unwrap_or(120).max(1)
    }

    /// How long a claim stays valid before another tick may take the job over.
    pub fn claim_lease_secs(&self) -> u64 {
        self.claim_lease_secs
            .unwrap_or_else(|| self.job_timeout_secs() + self.tick_interval_secs() * 2)
    }

    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts.unwrap_or(3).max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            base_delay_secs: self.retry_base_secs.unwrap_or(defaults.base_delay_secs),
            max_delay_secs: self.retry_max_secs.unwrap_or(defaults.max_delay_secs),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn json(&self) -> bool {
        self.format
            .as_deref()
            .is_some_and(|format| format.eq_ignore_ascii_case("json"))
    }
}

impl HttpConfig {
    pub fn insecure_tls(&self) -> bool {
        self.insecure_tls.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.dispatcher().timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.attachments().policy(), AttachmentPolicy::default());
        let scheduler = config.scheduler();
        assert!(scheduler.enabled());
        assert_eq!(scheduler.tick_interval_secs(), 5);
        assert_eq!(scheduler.default_max_attempts(), 3);
        assert_eq!(scheduler.retry_policy(), RetryPolicy::default());
        assert_eq!(config.logging().level(), "info");
        assert!(!config.logging().json());
        assert!(config.destinations.is_empty());
    }

    #[test]
    fn parses_every_section() {
        let config = Config::from_toml_str(
            r#"
            [dispatcher]
            timeout_secs = 10

            [attachments]
            max_size_bytes = 1024
            fetch_timeout_secs = 3

            [scheduler]
            enabled = false
            database_path = "/tmp/herald.db"
            tick_interval_secs = 2
            max_concurrent_jobs = 8
            retry_base_secs = 5
            retry_max_secs = 60

            [logging]
            level = "herald=debug"
            format = "json"

            [http]
            insecure_tls = true

            [[destinations]]
            url = "ntfy://alerts"
            tags = ["ops"]

            [[destinations]]
            url = "json://localhost/hook"
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatcher().timeout(), Duration::from_secs(10));
        assert_eq!(config.attachments().policy().max_size, 1024);
        let scheduler = config.scheduler();
        assert!(!scheduler.enabled());
        assert_eq!(scheduler.database_path(), Some("/tmp/herald.db"));
        assert_eq!(scheduler.max_concurrent_jobs(), 8);
        assert_eq!(scheduler.claim_lease_secs(), 124);
        assert_eq!(scheduler.retry_policy().max_delay_secs, 60);
        assert!(config.logging().json());
        assert!(config.http().insecure_tls());
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[0].tags, vec!["ops"]);
        assert!(config.destinations[1].tags.is_empty());
    }

    #[test]
    fn reports_parse_and_read_errors() {
        assert!(matches!(
            Config::from_toml_str("[scheduler]\ntick_interval_secs = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::load("/definitely/not/here/herald.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
