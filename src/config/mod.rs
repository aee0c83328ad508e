//! Configuration management for pingfleet
//!
//! Configuration is assembled once at startup from, in increasing priority:
//! built-in defaults, a TOML file, `PINGFLEET_*` environment variables and
//! command-line flags. The resulting [`Config`] is immutable and handed to
//! each component by reference.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fanout::SinkFailurePolicy;

const CONFIG_HOME: &str = ".pingfleet.toml";
const CONFIG_SYSTEM: &str = "/etc/pingfleet/config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Probe settings
    pub probe: ProbeConfig,

    /// Worker pool settings
    pub pool: PoolConfig,

    /// One-shot or periodic scheduling
    pub schedule: ScheduleConfig,

    /// Result delivery settings
    pub output: OutputConfig,

    /// Remote API endpoint
    pub api: ApiConfig,

    /// SQL database
    pub database: DatabaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// How hosts are probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    /// ICMP echo over a raw socket
    #[default]
    EchoPrivileged,
    /// ICMP echo over an unprivileged datagram socket
    EchoUnprivileged,
    /// Timed TCP connect
    TcpConnect,
}

impl std::str::FromStr for ProbeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "icmp" | "echo-privileged" => Ok(Self::EchoPrivileged),
            "udp" | "echo-unprivileged" => Ok(Self::EchoUnprivileged),
            "tcp" | "tcp-connect" => Ok(Self::TcpConnect),
            other => Err(Error::config(format!(
                "unknown probe mode '{other}', expected icmp, udp or tcp"
            ))),
        }
    }
}

/// Probe-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub mode: ProbeMode,

    /// Packets (echo) per host
    pub count: u32,

    /// Delay between echo requests
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-host timeout, defaults to `count` seconds
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Port used by tcp-connect when a host omits one
    pub default_port: u16,

    /// Print per-packet replies as they arrive
    pub verbose: bool,

    /// Buffer per-packet replies into the result instead of printing
    pub grouped: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::EchoPrivileged,
            count: 4,
            interval: Duration::from_secs(1),
            timeout: None,
            default_port: 80,
            verbose: true,
            grouped: false,
        }
    }
}

impl ProbeConfig {
    /// Effective per-host timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
            .unwrap_or_else(|| Duration::from_secs(u64::from(self.count.max(1))))
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of parallel probe workers
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Repeat interval; a single pass when unset
    #[serde(with = "humantime_serde")]
    pub every: Option<Duration>,
}

/// Result delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// What a failing sink does to the run
    pub on_sink_error: SinkFailurePolicy,
}

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, endpoint paths are appended to it
    pub url: String,

    pub name: String,

    pub secret: String,

    pub endpoints: ApiEndpoints,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Attempts per logical request
    pub max_attempts: u32,

    /// Delay before retrying a server error
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

/// API endpoint paths; `{server_id}` and `{id}` are substituted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiEndpoints {
    pub authenticate: String,
    pub get_devices: String,
    pub update_device: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            authenticate: String::from("/auth"),
            get_devices: String::from("/devices/{server_id}"),
            update_device: String::from("/devices/{id}"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            name: String::new(),
            secret: String::new(),
            endpoints: ApiEndpoints::default(),
            timeout_secs: 10,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `sqlite` or `postgres`
    pub driver: String,

    /// Connection string (file path for SQLite)
    pub params: String,

    /// Passed as the first parameter of the device query
    pub server_id: i64,

    pub queries: DatabaseQueries,

    /// Attempts per query before giving up
    pub max_attempts: u32,

    /// Pause before reconnecting
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

/// SQL templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseQueries {
    /// Returns `id, ip, inactive_since` rows; bound with the server id
    pub get_devices: String,

    /// Bound with loss, average time, inactive-since and id
    pub update_device: String,
}

impl Default for DatabaseQueries {
    fn default() -> Self {
        Self {
            get_devices: String::from(
                "SELECT id, ip, inactive_since FROM devices WHERE id_server = $1",
            ),
            update_device: String::from(
                "UPDATE devices SET loss = $1, average_time = $2, inactive_since = $3 WHERE id = $4",
            ),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: String::from("sqlite"),
            params: String::new(),
            server_id: 0,
            queries: DatabaseQueries::default(),
            max_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the first config file found in the usual places, else defaults
    pub fn discover() -> Result<Self> {
        match default_config_path() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                Self::from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Override values from `PINGFLEET_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("PINGFLEET_WORKERS") {
            self.pool.workers = v
                .parse()
                .map_err(|_| Error::config(format!("PINGFLEET_WORKERS is not a number: {v}")))?;
        }

        if let Ok(v) = std::env::var("PINGFLEET_API_URL") {
            self.api.url = v;
        }

        if let Ok(v) = std::env::var("PINGFLEET_API_SECRET") {
            self.api.secret = v;
        }

        if let Ok(v) = std::env::var("PINGFLEET_DB_PARAMS") {
            self.database.params = v;
        }

        if let Ok(v) = std::env::var("PINGFLEET_LOG_LEVEL") {
            self.logging.level = v;
        }

        if let Ok(v) = std::env::var("PINGFLEET_LOG_FORMAT") {
            self.logging.format = v;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(Error::config("workers must be greater than 0"));
        }

        if self.probe.count == 0 {
            return Err(Error::config("count must be greater than 0"));
        }

        if self.probe.timeout().is_zero() {
            return Err(Error::config("timeout must be greater than 0"));
        }

        if let Some(every) = self.schedule.every {
            if every.is_zero() {
                return Err(Error::config("repeat interval must be greater than 0"));
            }
        }

        if self.api.max_attempts == 0 || self.database.max_attempts == 0 {
            return Err(Error::config("max_attempts must be greater than 0"));
        }

        match self.database.driver.as_str() {
            "sqlite" | "postgres" => {}
            other => {
                return Err(Error::config(format!(
                    "unsupported database driver '{other}'"
                )))
            }
        }

        Ok(())
    }

    /// Validate the API section, needed only when an API source or sink is used
    pub fn validate_api(&self) -> Result<()> {
        url::Url::parse(&self.api.url)
            .map_err(|e| Error::config(format!("invalid API url '{}': {e}", self.api.url)))?;

        if self.api.name.is_empty() {
            return Err(Error::config("API name must be set"));
        }

        Ok(())
    }

    /// Validate the database section, needed only when a database source or sink is used
    pub fn validate_database(&self) -> Result<()> {
        if self.database.params.is_empty() {
            return Err(Error::config("database params must be set"));
        }

        Ok(())
    }
}

/// `$HOME/.pingfleet.toml`, then `/etc/pingfleet/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os("HOME") {
        let path = PathBuf::from(home).join(CONFIG_HOME);
        if path.exists() {
            return Some(path);
        }
    }

    let path = PathBuf::from(CONFIG_SYSTEM);
    path.exists().then_some(path)
}
