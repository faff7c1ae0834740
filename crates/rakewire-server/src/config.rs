//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`rakewire.toml`, `/etc/rakewire/rakewire.toml`,
//!   `~/.config/rakewire/rakewire.toml`, first match wins)
//! - Environment variables (`RAKEWIRE__SECTION__KEY`, e.g.
//!   `RAKEWIRE__LIMITS__MAX_CONNECTIONS=5000`), layered over the file.
//!   `[access]` rules are read from the file only, with channel names kept
//!   exactly as written.
//! - `RAKEWIRE_HOST`, `RAKEWIRE_PORT` and `JWT_SECRET` as defaults

use anyhow::{Context, Result};
use rakewire_core::{DirectoryConfig, HubConfig, Role, DEFAULT_OUTBOUND_CAPACITY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default config file locations, in lookup order.
pub const CONFIG_PATHS: [&str; 3] = [
    "rakewire.toml",
    "/etc/rakewire/rakewire.toml",
    "~/.config/rakewire/rakewire.toml",
];

/// Configuration that parses but cannot be served.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Auth is required but no secret was provided.
    #[error("auth.required is set but no JWT secret is configured (auth.jwt_secret or JWT_SECRET)")]
    MissingJwtSecret,

    /// Host and port do not form a socket address.
    #[error("Invalid bind address {0}")]
    InvalidBindAddr(String),

    /// Heartbeat enabled with a zero interval.
    #[error("heartbeat.interval_ms must be greater than zero")]
    ZeroHeartbeatInterval,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Handshake authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Channel access rules.
    #[serde(default)]
    pub access: AccessConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections, 0 for unlimited.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Run liveness sweeps.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Handshake authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Reject handshakes without a valid token. When off, every socket is
    /// admitted as an anonymous `user`.
    #[serde(default = "default_true")]
    pub required: bool,

    /// HS256 secret.
    #[serde(default = "default_jwt_secret", skip_serializing)]
    pub jwt_secret: Option<String>,

    /// Seconds of tolerated clock skew on `exp`.
    #[serde(default)]
    pub leeway_secs: u64,
}

/// Channel access rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Channel name -> roles allowed to subscribe. Unlisted channels are open.
    #[serde(default)]
    pub channels: HashMap<String, Vec<Role>>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RAKEWIRE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RAKEWIRE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_channels() -> usize {
    10_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue() -> usize {
    DEFAULT_OUTBOUND_CAPACITY
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_jwt_secret() -> Option<String> {
    std::env::var("JWT_SECRET").ok().filter(|s| !s.is_empty())
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            access: AccessConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_channels: default_max_channels(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: true,
            jwt_secret: default_jwt_secret(),
            leeway_secs: 0,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first existing default path, layered with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|p| shellexpand::tilde(p).into_owned())
            .find(|p| Path::new(p).exists());

        Self::load_layered(path.as_deref().map(Path::new))
    }

    /// Load configuration from `path` (if any), layered with environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or an override cannot be parsed.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        let mut access = AccessConfig::default();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
            access = Self::access_from_file(path)?;
        }

        let mut config: Config = builder
            .add_source(
                config::Environment::with_prefix("RAKEWIRE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        // `config` folds keys to lowercase, and channel names are keys here.
        config.access = access;

        Ok(config)
    }

    /// Read the `[access]` section with channel names as written.
    fn access_from_file(path: &Path) -> Result<AccessConfig> {
        #[derive(Deserialize)]
        struct AccessOnly {
            #[serde(default)]
            access: AccessConfig,
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let parsed: AccessOnly = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse access rules: {}", path.display()))?;

        Ok(parsed.access)
    }

    /// Load configuration from a specific file, without overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check settings that parse but cannot be served.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.required && self.auth.jwt_secret.is_none() {
            return Err(ConfigError::MissingJwtSecret);
        }
        if self.heartbeat.enabled && self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    /// Heartbeat interval, `None` when disabled.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat
            .enabled
            .then(|| Duration::from_millis(self.heartbeat.interval_ms))
    }

    /// Settings for the hub.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            directory: DirectoryConfig {
                max_channels: self.limits.max_channels,
                max_subscriptions_per_connection: self.limits.max_subscriptions_per_connection,
            },
            max_connections: self.limits.max_connections,
            heartbeat_interval: self.heartbeat_interval(),
            max_frame_size: self.limits.max_message_size,
        }
    }
}
