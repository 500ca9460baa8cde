//! Configuration file parsing and structures.
//!
//! garagewatch reads a single TOML file. The `[sync]` section picks the
//! operating mode, and the matching transport section (`[remote]` for direct
//! mode, `[relay]` for relayed mode) must be present.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::sync::SyncSettings;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Remote service, used in direct mode
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    /// Companion relay, used in relayed mode
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"garagewatch::relay" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    pub fn targets(&self) -> Targets {
        Targets::new()
            .with_default(LevelFilter::from(self.level))
            .with_targets(
                self.overrides
                    .iter()
                    .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
            )
    }
}

#[derive(
    Debug,
    Default,
    Deserialize,
    Serialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperatingMode {
    /// Talk straight to the remote service
    #[default]
    Direct,
    /// Talk through the paired companion device
    Relayed,
}

fn default_error_display_secs() -> u64 {
    5
}

fn default_relay_timeout_secs() -> u64 {
    10
}

fn default_relay_retry_secs() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: OperatingMode,

    /// How long an error stays visible
    #[serde(default = "default_error_display_secs")]
    pub error_display_secs: u64,

    /// Maximum wait for a relay reply
    #[serde(default = "default_relay_timeout_secs")]
    pub relay_timeout_secs: u64,

    /// Delay before retrying the initial state request when the relay was
    /// unreachable at startup
    #[serde(default = "default_relay_retry_secs")]
    pub relay_retry_secs: u64,

    /// Ask the companion whether it is running and connected before each command
    #[serde(default = "default_true")]
    pub preflight: bool,

    /// Periodic re-fetch in direct mode
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::default(),
            error_display_secs: default_error_display_secs(),
            relay_timeout_secs: default_relay_timeout_secs(),
            relay_retry_secs: default_relay_retry_secs(),
            preflight: true,
            poll_interval_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            error_display: Duration::from_secs(self.error_display_secs),
            relay_timeout: Duration::from_secs(self.relay_timeout_secs),
            relay_retry_delay: Duration::from_secs(self.relay_retry_secs),
            preflight: self.preflight,
            poll_interval: match self.mode {
                OperatingMode::Direct => self.poll_interval_secs.map(Duration::from_secs),
                OperatingMode::Relayed => None,
            },
        }
    }
}

fn default_remote_timeout_secs() -> u64 {
    10
}

/// REST endpoint of the remote service
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// e.g. `http://homeassistant.local:8123`
    pub base_url: String,

    /// Static bearer token sent with every request
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "garagewatch".to_string()
}

fn default_topic_prefix() -> String {
    "garagewatch".to_string()
}

/// MQTT broker shared with the companion device
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

/// HTTP API used by the presentation layer
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_listen(),
            port: default_api_port(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-section constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.sync.mode {
            OperatingMode::Direct if self.remote.is_none() => {
                return Err(ConfigError::Invalid(
                    "mode = \"direct\" requires a [remote] section".to_string(),
                ));
            }
            OperatingMode::Relayed if self.relay.is_none() => {
                return Err(ConfigError::Invalid(
                    "mode = \"relayed\" requires a [relay] section".to_string(),
                ));
            }
            _ => {}
        }

        let durations = [
            ("sync.error_display_secs", Some(self.sync.error_display_secs)),
            ("sync.relay_timeout_secs", Some(self.sync.relay_timeout_secs)),
            ("sync.relay_retry_secs", Some(self.sync.relay_retry_secs)),
            ("sync.poll_interval_secs", self.sync.poll_interval_secs),
            ("remote.timeout_secs", self.remote.as_ref().map(|r| r.timeout_secs)),
        ];
        for (field, value) in durations {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", field)));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
