//! Configuration management for webrtclite

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// TURN/STUN credential source
    #[serde(default)]
    pub turn: TurnConfig,

    /// Credential cache tuning
    #[serde(default)]
    pub credential_cache: CredentialCacheConfig,

    /// Reconnection policy
    #[serde(default)]
    pub reconnection: ReconnectionConfig,

    /// Stats sampling
    #[serde(default)]
    pub stats: StatsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where TURN credentials come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Base URL of the credential API (empty disables HTTP fetching)
    #[serde(default)]
    pub api_url: String,

    /// Value for the X-API-Key header
    #[serde(default)]
    pub api_key: String,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts before giving up on the API
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Shared secret for locally generated TURN REST credentials
    #[serde(default)]
    pub shared_secret: String,

    /// TURN host used with `shared_secret`
    #[serde(default)]
    pub server: String,

    #[serde(default = "default_turn_port")]
    pub port: u16,

    #[serde(default = "default_turn_tls_port")]
    pub tls_port: u16,

    /// Lifetime of generated credentials
    #[serde(default = "default_credential_ttl_secs")]
    pub credential_ttl_secs: u32,

    /// STUN servers used when no TURN relay is available
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,

    /// Serve STUN-only credentials when the API is unreachable
    #[serde(default = "default_fallback_to_stun")]
    pub fallback_to_stun: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            retry_count: default_retry_count(),
            shared_secret: String::new(),
            server: String::new(),
            port: default_turn_port(),
            tls_port: default_turn_tls_port(),
            credential_ttl_secs: default_credential_ttl_secs(),
            stun_urls: default_stun_urls(),
            fallback_to_stun: default_fallback_to_stun(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialCacheConfig {
    /// Background sweep period
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Entries this close to expiry are refreshed by the sweep
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: u64,
}

impl Default for CredentialCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            refresh_buffer_secs: default_refresh_buffer_secs(),
        }
    }
}

impl CredentialCacheConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    /// Recovery attempts before the call is declared failed
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Backoff before attempt 1, 2, 3 ... in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,

    /// How long a callee waits for the caller to renegotiate
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            backoff_ms: default_backoff_ms(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl ReconnectionConfig {
    pub fn backoff_table(&self) -> Vec<Duration> {
        self.backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Sampling period for connection statistics
    #[serde(default = "default_stats_interval_ms")]
    pub interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_ms: default_stats_interval_ms() }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply TURN_API_URL / TURN_API_KEY from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TURN_API_URL") {
            if !url.is_empty() {
                self.turn.api_url = url;
            }
        }
        if let Ok(key) = std::env::var("TURN_API_KEY") {
            if !key.is_empty() {
                self.turn.api_key = key;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credential_cache.refresh_interval_secs == 0 {
            return Err(invalid("Credential refresh interval must be non-zero"));
        }

        if self.reconnection.max_retry_attempts == 0 {
            return Err(invalid("Reconnection max_retry_attempts must be non-zero"));
        }

        if self.reconnection.backoff_ms.is_empty() {
            return Err(invalid("Reconnection backoff table cannot be empty"));
        }

        if self.reconnection.backoff_ms.iter().any(|ms| *ms == 0) {
            return Err(invalid("Reconnection backoff entries must be non-zero"));
        }

        if self.reconnection.recovery_timeout_secs == 0 {
            return Err(invalid("Reconnection recovery timeout must be non-zero"));
        }

        if self.stats.interval_ms == 0 {
            return Err(invalid("Stats interval must be non-zero"));
        }

        if self.turn.timeout_secs == 0 {
            return Err(invalid("TURN API timeout must be non-zero"));
        }

        if self.turn.retry_count == 0 {
            return Err(invalid("TURN API retry_count must be non-zero"));
        }

        if !(60..=86_400).contains(&self.turn.credential_ttl_secs) {
            return Err(invalid("TURN credential TTL must be between 60 and 86400 seconds"));
        }

        if !self.turn.shared_secret.is_empty() && self.turn.server.is_empty() {
            return Err(invalid("TURN shared_secret requires a TURN server"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}


fn default_timeout_secs() -> u64 { 10 }
fn default_retry_count() -> u32 { 3 }
fn default_turn_port() -> u16 { 3478 }
fn default_turn_tls_port() -> u16 { 5349 }
fn default_credential_ttl_secs() -> u32 { 86_400 }
fn default_fallback_to_stun() -> bool { true }
fn default_refresh_interval_secs() -> u64 { 60 }
fn default_refresh_buffer_secs() -> u64 { 300 }
fn default_max_retry_attempts() -> u32 { 3 }
fn default_backoff_ms() -> Vec<u64> { vec![1000, 2000, 4000] }
fn default_recovery_timeout_secs() -> u64 { 15 }
fn default_stats_interval_ms() -> u64 { 1000 }

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
