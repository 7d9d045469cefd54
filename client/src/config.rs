//! Layered client configuration.
//!
//! 1. Defaults (from code)
//! 2. Config file (`brand-audit.toml`)
//! 3. Environment variables (`BRAND_AUDIT_` prefix, `__` for nesting),
//!    e.g. `BRAND_AUDIT_RETRY__MAX_ATTEMPTS=5`

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connection::ConnectionConfig;
use crate::retry::RetryConfig;

pub const ENV_PREFIX: &str = "BRAND_AUDIT";
pub const CONFIG_FILENAME: &str = "brand-audit.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid configuration value: {0}")]
    Validation(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Load(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub circuit: CircuitSection,
    #[serde(default)]
    pub connection: ConnectionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Bearer token attached to every request when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Wait used for a 429 without a `Retry-After` header.
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_staleness_check_ms")]
    pub staleness_check_ms: u64,
    #[serde(default = "default_degraded_after_ms")]
    pub degraded_after_ms: u64,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_stream_url() -> String {
    "ws://localhost:8000/ws".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_jitter_ms() -> u64 {
    1000
}
fn default_retry_after_secs() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_open_secs() -> u64 {
    60
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    10_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_staleness_check_ms() -> u64 {
    5000
}
fn default_degraded_after_ms() -> u64 {
    30_000
}
fn default_stale_after_ms() -> u64 {
    60_000
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            stream_url: default_stream_url(),
            request_timeout_ms: default_request_timeout_ms(),
            auth_token: None,
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            default_retry_after_secs: default_retry_after_secs(),
        }
    }
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_secs: default_open_secs(),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            staleness_check_ms: default_staleness_check_ms(),
            degraded_after_ms: default_degraded_after_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_url("api.base_url", &self.api.base_url)?;
        parse_url("api.stream_url", &self.api.stream_url)?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Validation(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "circuit.failure_threshold must be at least 1".to_string(),
            ));
        }
        let conn = &self.connection;
        if conn.heartbeat_interval_ms == 0 || conn.staleness_check_ms == 0 {
            return Err(ConfigError::Validation(
                "connection intervals must be non-zero".to_string(),
            ));
        }
        if conn.degraded_after_ms >= conn.stale_after_ms {
            return Err(ConfigError::Validation(format!(
                "connection.degraded_after_ms ({}) must be below connection.stale_after_ms ({})",
                conn.degraded_after_ms, conn.stale_after_ms
            )));
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        parse_url("api.base_url", &self.api.base_url)
    }

    pub fn stream_url(&self) -> Result<Url, ConfigError> {
        parse_url("api.stream_url", &self.api.stream_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.api.request_timeout_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.retry.default_retry_after_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: Duration::from_millis(self.retry.jitter_ms),
        }
    }

    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit.failure_threshold,
            open_duration: Duration::from_secs(self.circuit.open_secs),
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let conn = &self.connection;
        ConnectionConfig {
            connect_timeout: Duration::from_millis(conn.connect_timeout_ms),
            reconnect_base: Duration::from_millis(conn.reconnect_base_ms),
            reconnect_max: Duration::from_millis(conn.reconnect_max_ms),
            max_reconnect_attempts: conn.max_reconnect_attempts,
            heartbeat_interval: Duration::from_millis(conn.heartbeat_interval_ms),
            staleness_check_interval: Duration::from_millis(conn.staleness_check_ms),
            degraded_after: Duration::from_millis(conn.degraded_after_ms),
            stale_after: Duration::from_millis(conn.stale_after_ms),
        }
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Validation(format!("{field} '{value}': {e}")))
}

/// Configuration loader with layered merging support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn load(&self) -> Result<ClientConfig, ConfigError> {
        let mut builder = Config::builder();

        // Defaults serialized to JSON form the base layer.
        let defaults_json = serde_json::to_string(&ClientConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        if let Some(ref path) = self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_ref()));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ClientConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Looks for `./brand-audit.toml`, then
    /// `$XDG_CONFIG_HOME/brand-audit/config.toml`.
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from(format!("./{CONFIG_FILENAME}"));
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        let xdg_config = dirs::config_dir()?.join("brand-audit").join("config.toml");
        xdg_config.exists().then_some(xdg_config)
    }

    pub fn load_default() -> Result<ClientConfig, ConfigError> {
        match Self::find_config_file() {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::new().load(),
        }
    }
}
