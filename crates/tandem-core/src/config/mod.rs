//! Group configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: Hardcoded in struct `Default` implementations
//! 2. **Config file**: TOML file specified by `TANDEM_CONFIG` env var
//! 3. **Environment variables**: `TANDEM__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`MemberConfig`]: ordered provider endpoints with per-member credentials
//! - [`ReconnectConfig`]: attempt limit and backoff bounds
//! - [`HandshakeConfig`]: per-member login and directory timeouts
//! - [`LoggingConfig`]: Log level and format
//!
//! # Example
//!
//! ```toml
//! mode = "service_based"
//!
//! [[members]]
//! name = "primary"
//! endpoint = "ads1.example.com:14002"
//! credentials = { user_name = "svc-feed", application_id = "256" }
//!
//! [[members]]
//! name = "backup"
//! endpoint = "ads2.example.com:14002"
//!
//! [reconnect]
//! attempt_limit = -1
//! max_delay_ms = 10000
//! ```

use crate::types::StandbyMode;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

/// Login identity presented to one member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Overrides the user name of the application's login request.
    #[serde(default)]
    pub user_name: Option<String>,

    #[serde(default)]
    pub application_id: Option<String>,

    /// Client position, usually `host/ip`.
    #[serde(default)]
    pub position: Option<String>,
}

/// One provider endpoint. Order in the member list is promotion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub name: String,

    pub endpoint: String,

    #[serde(default)]
    pub credentials: Credentials,
}

impl MemberConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self { name: name.into(), endpoint: endpoint.into(), credentials: Credentials::default() }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Reconnect policy applied to each member independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect attempts allowed after a failure; `-1` retries forever. Defaults to `-1`.
    #[serde(default = "default_attempt_limit")]
    pub attempt_limit: i32,

    /// Delay before the first reconnect. Defaults to `1000`.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Upper bound of the exponential backoff. Defaults to `30000`.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the delay added as random jitter. Defaults to `0.1`.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_attempt_limit() -> i32 {
    -1
}

fn default_min_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempt_limit: default_attempt_limit(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.attempt_limit < 0
    }

    #[must_use]
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Per-member handshake settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Time from connect to login refresh. Defaults to `45000`.
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,

    /// Time from login refresh to directory refresh. Defaults to `45000`.
    #[serde(default = "default_directory_timeout_ms")]
    pub directory_timeout_ms: u64,

    /// Request the source directory on every member after login. Defaults to `true`.
    #[serde(default = "default_request_directory")]
    pub request_directory: bool,
}

fn default_login_timeout_ms() -> u64 {
    45_000
}

fn default_directory_timeout_ms() -> u64 {
    45_000
}

fn default_request_directory() -> bool {
    true
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            login_timeout_ms: default_login_timeout_ms(),
            directory_timeout_ms: default_directory_timeout_ms(),
            request_directory: default_request_directory(),
        }
    }
}

impl HandshakeConfig {
    #[must_use]
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    #[must_use]
    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Top-level configuration of a warm-standby group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TandemConfig {
    #[serde(default)]
    pub mode: StandbyMode,

    #[serde(default)]
    pub members: Vec<MemberConfig>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TandemConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `TANDEM__` prefix can override any configuration
    /// value. Use `__` as a separator for nested fields (e.g.,
    /// `TANDEM__RECONNECT__ATTEMPT_LIMIT=5`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("mode", "login_based")?
            .set_default("reconnect.attempt_limit", i64::from(default_attempt_limit()))?
            .set_default("reconnect.min_delay_ms", default_min_delay_ms())?
            .set_default("reconnect.max_delay_ms", default_max_delay_ms())?
            .set_default("reconnect.jitter_factor", default_jitter_factor())?
            .set_default("handshake.login_timeout_ms", default_login_timeout_ms())?
            .set_default("handshake.directory_timeout_ms", default_directory_timeout_ms())?
            .set_default("handshake.request_directory", default_request_directory())?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("TANDEM").prefix_separator("__").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/tandem.toml` with fallback to defaults.
    ///
    /// The config file path can be overridden using the `TANDEM_CONFIG` environment
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("TANDEM_CONFIG").unwrap_or_else(|_| "config/tandem.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// Checks include:
    /// - At least one member is configured, with unique names and non-empty endpoints
    /// - The reconnect limit is `-1` or greater and the backoff bounds are ordered
    /// - Service-based groups request the directory, since ownership is per service
    /// - Logging format is either `"json"` or `"pretty"`
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.members.is_empty() {
            return Err("No warm standby members configured".to_string());
        }

        let mut names = HashSet::new();
        for member in &self.members {
            if member.endpoint.is_empty() {
                return Err(format!("Empty endpoint for member: {}", member.name));
            }
            if !names.insert(member.name.as_str()) {
                return Err(format!("Duplicate member name: {}", member.name));
            }
        }

        if self.reconnect.attempt_limit < -1 {
            return Err("Reconnect attempt limit must be -1 (unlimited) or greater".to_string());
        }

        if self.reconnect.min_delay_ms > self.reconnect.max_delay_ms {
            return Err("Reconnect min delay must not exceed max delay".to_string());
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter_factor) {
            return Err("Reconnect jitter factor must be between 0 and 1".to_string());
        }

        if self.handshake.login_timeout_ms == 0 || self.handshake.directory_timeout_ms == 0 {
            return Err("Handshake timeouts must be greater than 0".to_string());
        }

        if self.mode == StandbyMode::ServiceBased && !self.handshake.request_directory {
            return Err("Service based warm standby requires the source directory".to_string());
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
