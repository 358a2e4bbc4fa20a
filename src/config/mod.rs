//! Configuration Module
//!
//! Provides TOML-based configuration for MeshMQ with support for:
//! - Server settings (bind address, workers, TLS, PROXY protocol)
//! - Connection limits
//! - Session parameters
//! - MQTT feature flags
//! - Subscription store backend selection
//! - Persistence and cluster configuration
//! - Environment variable overrides (MESHMQ__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

// Re-export cluster config types
pub use cluster::ClusterConfig;

// Re-export persistence config types
pub use persistence::{BackendType, PersistenceConfig};

// Re-export PROXY protocol config types
pub use proxy::ProxyProtocolConfig;

// Re-export subscription store config types
pub use store::{RedisStoreConfig, StoreConfig, StoreType};

mod cluster;
mod persistence;
mod proxy;
mod store;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Subscription store backend configuration
    pub store: StoreConfig,
    /// Persistence configuration
    pub persistence: PersistenceConfig,
    /// Cluster configuration (only first entry is used if multiple)
    #[serde(default)]
    pub cluster: Vec<ClusterConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// TLS bind address (optional, enables MQTT over TLS)
    pub tls_bind: Option<SocketAddr>,
    /// WebSocket bind address (optional)
    pub ws_bind: Option<SocketAddr>,
    /// WebSocket path (default: "/mqtt")
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Number of worker threads (0 = auto)
    #[serde(default)]
    pub workers: usize,
    /// TLS configuration (required when tls_bind is set)
    #[serde(default)]
    pub tls: Option<ServerTlsConfig>,
    /// PROXY protocol handling for the plain TCP listener
    #[serde(default)]
    pub proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol handling for the TLS listener
    #[serde(default)]
    pub tls_proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol handling for the WebSocket listener
    #[serde(default)]
    pub ws_proxy_protocol: ProxyProtocolConfig,
}

/// TLS configuration for the server
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerTlsConfig {
    /// Path to certificate file (PEM format)
    pub cert: String,
    /// Path to private key file (PEM format)
    pub key: String,
    /// Path to CA certificate file for client authentication (PEM format, optional)
    pub ca_cert: Option<String>,
    /// Require client certificate authentication
    #[serde(default)]
    pub require_client_cert: bool,
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:1883".parse().unwrap()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tls_bind: None,
            ws_bind: None,
            ws_path: default_ws_path(),
            workers: 0,
            tls: None,
            proxy_protocol: ProxyProtocolConfig::default(),
            tls_proxy_protocol: ProxyProtocolConfig::default(),
            ws_proxy_protocol: ProxyProtocolConfig::default(),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Maximum in-flight messages per client (QoS 1/2)
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,
    /// Maximum queued messages per offline client
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Maximum pending PUBREL for QoS 2
    #[serde(default = "default_max_awaiting_rel")]
    pub max_awaiting_rel: usize,
    /// Seconds before retrying unacked messages
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Per-connection outbound message channel capacity.
    /// This buffer holds messages waiting to be written to the client socket.
    /// Higher values handle burst traffic better but use more memory per connection.
    /// Set to 0 for unbounded (not recommended for production).
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
    /// Maximum topic levels accepted in a published topic name
    #[serde(default = "default_max_topic_levels")]
    pub max_topic_levels: usize,
}

fn default_max_connections() -> usize {
    100_000
}
fn default_max_packet_size() -> usize {
    1024 * 1024
}
fn default_max_inflight() -> u16 {
    32
}
fn default_max_queued_messages() -> usize {
    1000
}
fn default_max_awaiting_rel() -> usize {
    100
}
fn default_retry_interval() -> u64 {
    30
}
fn default_outbound_channel_capacity() -> usize {
    1024
}
fn default_max_topic_levels() -> usize {
    128
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_packet_size: default_max_packet_size(),
            max_inflight: default_max_inflight(),
            max_queued_messages: default_max_queued_messages(),
            max_awaiting_rel: default_max_awaiting_rel(),
            retry_interval: default_retry_interval(),
            outbound_channel_capacity: default_outbound_channel_capacity(),
            max_topic_levels: default_max_topic_levels(),
        }
    }
}

impl LimitsConfig {
    /// Get retry interval as Duration
    pub fn retry_interval_duration(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default keep alive in seconds
    #[serde(default = "default_keep_alive")]
    pub default_keep_alive: u16,
    /// Maximum keep alive in seconds
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u16,
    /// Session expiry check interval in seconds
    #[serde(default = "default_expiry_check_interval")]
    pub expiry_check_interval: u64,
    /// Maximum topic aliases
    #[serde(default = "default_max_topic_aliases")]
    pub max_topic_aliases: u16,
}

fn default_keep_alive() -> u16 {
    60
}
fn default_max_keep_alive() -> u16 {
    65535
}
fn default_expiry_check_interval() -> u64 {
    60
}
fn default_max_topic_aliases() -> u16 {
    65535
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: default_keep_alive(),
            max_keep_alive: default_max_keep_alive(),
            expiry_check_interval: default_expiry_check_interval(),
            max_topic_aliases: default_max_topic_aliases(),
        }
    }
}

impl SessionConfig {
    /// Get expiry check interval as Duration
    pub fn expiry_check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval)
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are available
    #[serde(default = "default_true")]
    pub retain_available: bool,
    /// Whether wildcard subscriptions are available
    #[serde(default = "default_true")]
    pub wildcard_subscriptions: bool,
    /// Whether subscription identifiers are available
    #[serde(default = "default_true")]
    pub subscription_identifiers: bool,
    /// Whether shared subscriptions are available
    #[serde(default = "default_true")]
    pub shared_subscriptions: bool,
    /// Whether $SYS topics are published
    #[serde(default = "default_true")]
    pub sys_topics: bool,
    /// $SYS topic publish interval in seconds
    #[serde(default = "default_sys_interval")]
    pub sys_interval: u64,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}
fn default_sys_interval() -> u64 {
    10
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            shared_subscriptions: true,
            sys_topics: true,
            sys_interval: default_sys_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MESHMQ__` prefix with double underscores for nesting:
    ///    - `MESHMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `MESHMQ__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.ws_path", "/mqtt")?
            .set_default("server.workers", 0)?
            .set_default("limits.max_connections", 100_000)?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.max_inflight", 32)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.max_awaiting_rel", 100)?
            .set_default("limits.retry_interval", 30)?
            .set_default("limits.outbound_channel_capacity", 1024)?
            .set_default("limits.max_topic_levels", 128)?
            .set_default("session.default_keep_alive", 60)?
            .set_default("session.max_keep_alive", 65535)?
            .set_default("session.expiry_check_interval", 60)?
            .set_default("session.max_topic_aliases", 65535)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.wildcard_subscriptions", true)?
            .set_default("mqtt.subscription_identifiers", true)?
            .set_default("mqtt.shared_subscriptions", true)?
            .set_default("mqtt.sys_topics", true)?
            .set_default("mqtt.sys_interval", 10)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (MESHMQ__SERVER__BIND, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MESHMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        // Note: 0 means unbounded for limits expressed in the broker (see BrokerConfig
        // construction), but max_inflight of 0 here would mean "no in-flight capacity",
        // which is never useful, so it is rejected outright.
        if self.limits.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "limits.max_inflight must be greater than 0".to_string(),
            ));
        }

        if self.server.tls_bind.is_some() {
            match &self.server.tls {
                Some(tls) => {
                    if tls.cert.is_empty() {
                        return Err(ConfigError::Validation(
                            "tls.cert is required when tls_bind is set".to_string(),
                        ));
                    }
                    if tls.key.is_empty() {
                        return Err(ConfigError::Validation(
                            "tls.key is required when tls_bind is set".to_string(),
                        ));
                    }
                }
                None => {
                    return Err(ConfigError::Validation(
                        "tls configuration is required when tls_bind is set".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
