use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub job_engine: ServiceConfig,
    pub placement: ServiceConfig,
    pub directory: ServiceConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("migrator.db")
}

/// Connection settings for an external HTTP service
/// (job engine, placement service, instance directory).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Base URL (e.g., "http://cnapi.local")
    pub url: String,
    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
}

fn default_timeout() -> u32 {
    30
}

/// Migration behaviour settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MigrationConfig {
    /// Capacity of each watcher queue. A watcher that falls further behind
    /// than this is disconnected.
    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,

    /// Extra `smartdc_role` tag values that mark an instance as protected,
    /// on top of the built-in core and NAT rules.
    #[serde(default)]
    pub protected_roles: Vec<String>,

    /// Initial delay before retrying to record a finished job's result, in
    /// milliseconds. Doubles on every failed attempt.
    #[serde(default = "default_settle_retry_initial")]
    pub settle_retry_initial_ms: u64,

    /// Upper bound of the delay between attempts, in milliseconds.
    #[serde(default = "default_settle_retry_max")]
    pub settle_retry_max_ms: u64,
}

fn default_watch_buffer() -> usize {
    256
}

fn default_settle_retry_initial() -> u64 {
    100
}

fn default_settle_retry_max() -> u64 {
    30_000 // 30 seconds
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            watch_buffer: default_watch_buffer(),
            protected_roles: Vec::new(),
            settle_retry_initial_ms: default_settle_retry_initial(),
            settle_retry_max_ms: default_settle_retry_max(),
        }
    }
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub job_engine: SanitizedServiceConfig,
    pub placement: SanitizedServiceConfig,
    pub directory: SanitizedServiceConfig,
    pub migration: MigrationConfig,
}

/// Sanitized service config (token hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedServiceConfig {
    pub url: String,
    pub api_token_configured: bool,
    pub timeout_secs: u32,
}

impl From<&ServiceConfig> for SanitizedServiceConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_token_configured: config
                .api_token
                .as_ref()
                .is_some_and(|token| !token.is_empty()),
            timeout_secs: config.timeout_secs,
        }
    }
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            job_engine: SanitizedServiceConfig::from(&config.job_engine),
            placement: SanitizedServiceConfig::from(&config.placement),
            directory: SanitizedServiceConfig::from(&config.directory),
            migration: config.migration.clone(),
        }
    }
}
