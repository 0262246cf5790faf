//! Server configuration loading from file and environment variables.

use beacon_db::DbRuntimeSettings;
use beacon_queue::RetryPolicy;
use beacon_upstream::{monitored_table, UpstreamConfig, DEFAULT_REFERENCE_TABLES};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Agent role: where to push local changes.
    #[serde(default)]
    pub upstream: UpstreamSection,

    /// Hub role: accepting pushes from agents.
    #[serde(default)]
    pub hub: HubConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "beacon_queue=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Consumer timing shared by every queue consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Longest sleep between drains when no wake-up arrives.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long a claimed event stays invisible to other workers.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,

    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lifetime of cached rules and team specs.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Workers delivering `notification.send` events.
    #[serde(default = "default_send_consumers")]
    pub send_consumers: usize,

    /// Endpoint receiving deliveries whose target is not a URL.
    #[serde(default)]
    pub relay_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub agent_name: String,

    /// `key=value` labels sent with every push.
    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default = "default_upstream_batch_size")]
    pub batch_size: usize,

    /// Seconds between reference-data pulls. 0 disables pulling.
    #[serde(default = "default_pull_interval_secs")]
    pub pull_interval_secs: u64,

    #[serde(default = "default_pull_timeout_secs")]
    pub pull_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Credentials agents must present.
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Tables served by the pull endpoint.
    #[serde(default = "default_reference_tables")]
    pub reference_tables: Vec<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "beacon.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    10
}

fn default_lease_secs() -> u64 {
    300
}

fn default_retry_base_secs() -> u64 {
    1
}

fn default_retry_max_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_send_consumers() -> usize {
    5
}

fn default_upstream_batch_size() -> usize {
    100
}

fn default_pull_interval_secs() -> u64 {
    300
}

fn default_pull_timeout_secs() -> u64 {
    60
}

fn default_reference_tables() -> Vec<String> {
    DEFAULT_REFERENCE_TABLES.iter().map(|t| t.to_string()).collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            lease_secs: default_lease_secs(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_secs: default_cache_ttl_secs(),
            send_consumers: default_send_consumers(),
            relay_url: None,
        }
    }
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            agent_name: String::new(),
            labels: Vec::new(),
            batch_size: default_upstream_batch_size(),
            pull_interval_secs: default_pull_interval_secs(),
            pull_timeout_secs: default_pull_timeout_secs(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            password: String::new(),
            reference_tables: default_reference_tables(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl QueueConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry_base_secs),
            max: Duration::from_secs(self.retry_max_secs.max(self.retry_base_secs)),
        }
    }
}

impl UpstreamSection {
    pub fn client_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            host: self.host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            agent_name: self.agent_name.clone(),
            labels: self.labels.clone(),
        }
    }

    /// Connection settings when the agent role is fully configured.
    ///
    /// A partially filled section is logged and treated as absent.
    pub fn enabled(&self) -> Option<UpstreamConfig> {
        let config = self.client_config();
        if config.is_complete() {
            return Some(config);
        }
        if config.is_partial() {
            tracing::warn!(
                host = %config.host,
                agent_name = %config.agent_name,
                "upstream config is incomplete (host, username, password and agent_name are all required), push disabled"
            );
        }
        None
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Checks settings that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.enabled {
            if self.hub.username.is_empty() || self.hub.password.is_empty() {
                return Err(ConfigError::Invalid(
                    "hub.username and hub.password are required when the hub is enabled".to_string(),
                ));
            }
            for table in &self.hub.reference_tables {
                monitored_table(table).map_err(|e| ConfigError::Invalid(e.to_string()))?;
            }
        }
        if self.upstream.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "upstream.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `BEACON_HOST`, `BEACON_PORT` override `server.host` and `server.port`
/// - `BEACON_DB_PATH` overrides `database.path`
/// - `BEACON_LOG_LEVEL` overrides `logging.level`
/// - `BEACON_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `BEACON_UPSTREAM_HOST`, `BEACON_UPSTREAM_USERNAME`,
///   `BEACON_UPSTREAM_PASSWORD`, `BEACON_AGENT_NAME` override `upstream.*`
/// - `BEACON_HUB_USERNAME`, `BEACON_HUB_PASSWORD` override `hub.*`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Applies `BEACON_*` overrides read through `var`.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(parsed) = var("BEACON_HOST").and_then(|h| h.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = var("BEACON_PORT").and_then(|p| p.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(db_path) = var("BEACON_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("BEACON_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("BEACON_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    let strings = [
        ("BEACON_UPSTREAM_HOST", &mut config.upstream.host),
        ("BEACON_UPSTREAM_USERNAME", &mut config.upstream.username),
        ("BEACON_UPSTREAM_PASSWORD", &mut config.upstream.password),
        ("BEACON_AGENT_NAME", &mut config.upstream.agent_name),
        ("BEACON_HUB_USERNAME", &mut config.hub.username),
        ("BEACON_HUB_PASSWORD", &mut config.hub.password),
    ];
    for (key, field) in strings {
        if let Some(value) = var(key) {
            *field = value;
        }
    }
}
