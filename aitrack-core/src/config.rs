//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/aitrack/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/aitrack/` (~/.config/aitrack/)
//! - Data: `$XDG_DATA_HOME/aitrack/` (~/.local/share/aitrack/)
//! - State/Logs: `$XDG_STATE_HOME/aitrack/` (~/.local/state/aitrack/)
//!
//! The delivery endpoint and signing secret are "live" settings: the pipeline
//! asks a [`SettingsSource`] for them every time it signs or delivers, so edits
//! to the config file take effect without a restart.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Environment variable that overrides `delivery.secret`
pub const SECRET_ENV_VAR: &str = "AITRACK_SECRET";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Webhook delivery configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Webhook delivery configuration
///
/// `endpoint` and `secret` are optional. Without a secret batches are dropped
/// at signing time; without an endpoint they wait in the failure queue.
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Webhook URL receiving signed batches
    pub endpoint: Option<String>,

    /// Shared HMAC secret
    pub secret: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Quiet period before a batch is flushed, in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            secret: None,
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_debounce_ms() -> u64 {
    1200
}

impl DeliveryConfig {
    /// Check if both endpoint and secret are present
    pub fn is_ready(&self) -> bool {
        self.endpoint.is_some() && self.secret.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.endpoint {
            let url = reqwest::Url::parse(endpoint).map_err(|e| {
                Error::Config(format!("delivery.endpoint is not a valid URL: {}", e))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(Error::Config(
                    "delivery.endpoint must use http or https".to_string(),
                ));
            }
        }
        if !(100..=10_000).contains(&self.debounce_ms) {
            return Err(Error::Config(
                "delivery.debounce_ms must be between 100 and 10000".to_string(),
            ));
        }
        if self.max_retries > 10 {
            return Err(Error::Config(
                "delivery.max_retries must be at most 10".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "delivery.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Current endpoint/secret pair, with the secret env var taking precedence
    pub fn settings(&self) -> Settings {
        let secret = std::env::var(SECRET_ENV_VAR)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.secret.clone());
        Settings {
            endpoint: self.endpoint.clone(),
            secret,
        }
    }
}

/// Endpoint and secret as seen at the moment of signing or delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub endpoint: Option<String>,
    pub secret: Option<String>,
}

/// Supplies live delivery settings
pub trait SettingsSource: Send + Sync {
    /// Read the current settings. Called on every sign and deliver.
    fn current(&self) -> Result<Settings>;
}

/// Fixed settings, mostly for tests and one-shot commands
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub Settings);

impl StaticSettings {
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self(Settings {
            endpoint: Some(endpoint.into()),
            secret: Some(secret.into()),
        })
    }
}

impl SettingsSource for StaticSettings {
    fn current(&self) -> Result<Settings> {
        Ok(self.0.clone())
    }
}

/// Fingerprint of the config file the cached section was parsed from
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

/// Live view of the `[delivery]` section of a config file.
///
/// Each call stats the file and only re-parses it when its modification
/// time or size changed, so edits are picked up without restarting.
#[derive(Debug)]
pub struct ConfigFileSettings {
    path: PathBuf,
    cached: Mutex<Option<(FileStamp, DeliveryConfig)>>,
}

impl ConfigFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    /// Settings backed by the default config path
    pub fn default_path() -> Self {
        Self::new(Config::config_path())
    }

    fn delivery(&self) -> Result<DeliveryConfig> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.cached.lock().unwrap() = None;
                return Ok(DeliveryConfig::default());
            }
            Err(e) => return Err(e.into()),
        };
        let stamp = FileStamp {
            modified: metadata.modified()?,
            len: metadata.len(),
        };

        let mut cached = self.cached.lock().unwrap();
        if let Some((seen, delivery)) = cached.as_ref() {
            if *seen == stamp {
                return Ok(delivery.clone());
            }
        }

        tracing::debug!(path = ?self.path, "Reloading delivery settings");
        let delivery = Config::load_from(&self.path)?.delivery;
        *cached = Some((stamp, delivery.clone()));
        Ok(delivery)
    }
}

impl SettingsSource for ConfigFileSettings {
    fn current(&self) -> Result<Settings> {
        Ok(self.delivery()?.settings())
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.delivery.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/aitrack/config.toml` (~/.config/aitrack/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("aitrack").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/aitrack/` (~/.local/share/aitrack/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("aitrack")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/aitrack/` (~/.local/state/aitrack/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("aitrack")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/aitrack/data.db` (~/.local/share/aitrack/data.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }
}
