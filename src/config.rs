//! Configuration for kv-failover

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FailoverError, Result};

/// Address of one monitoring agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorAddress {
    pub host: String,
    pub port: u16,
}

impl MonitorAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for MonitorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for MonitorAddress {
    type Err = FailoverError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)?;
        Ok(Self { host, port })
    }
}

/// Address of a data node, as resolved by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn split_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| FailoverError::Config(format!("Expected host:port, got '{}'", s)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| FailoverError::Config(format!("Invalid port in '{}': {}", s, e)))?;
    Ok((host.to_string(), port))
}

/// Role a node is expected to hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Primary,
    Replica,
}

impl Role {
    /// Name the data node uses for this role in ROLE and INFO replies.
    pub fn wire_name(self) -> &'static str {
        match self {
            Role::Primary => "master",
            Role::Replica => "slave",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Replica => f.write_str("replica"),
        }
    }
}

impl FromStr for Role {
    type Err = FailoverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" | "master" => Ok(Role::Primary),
            "replica" | "slave" => Ok(Role::Replica),
            other => Err(FailoverError::Config(format!("Unknown role '{}'", other))),
        }
    }
}

/// Severity a lifecycle event is logged at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
    /// Event is not logged at all
    Off,
}

/// Severity mapping for supervisor lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_disconnection_severity")]
    pub disconnection: LogSeverity,

    #[serde(default = "default_failed_connection_severity")]
    pub failed_connection: LogSeverity,

    #[serde(default = "default_reconnection_severity")]
    pub reconnection: LogSeverity,
}

fn default_disconnection_severity() -> LogSeverity {
    LogSeverity::Error
}

fn default_failed_connection_severity() -> LogSeverity {
    LogSeverity::Error
}

fn default_reconnection_severity() -> LogSeverity {
    LogSeverity::Info
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            disconnection: default_disconnection_severity(),
            failed_connection: default_failed_connection_severity(),
            reconnection: default_reconnection_severity(),
        }
    }
}

/// Connection parameters merged into every data node connect.
///
/// Monitor connections reuse the timeouts but never the credentials or database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub database: Option<i64>,

    /// TCP connect timeout in milliseconds (0 = none)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds (0 = none)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            database: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ConnectOptions {
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.request_timeout_ms)
    }

    /// Same timeouts, no credentials or database selection.
    pub fn for_monitor(&self) -> Self {
        Self {
            username: None,
            password: None,
            database: None,
            connect_timeout_ms: self.connect_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
        }
    }
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Monitors in priority order
    pub monitors: Vec<MonitorAddress>,

    /// Group name the monitors track
    pub group: String,

    #[serde(default)]
    pub role: Role,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Retry delay cap in milliseconds (0 = unbounded)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Role re-verification interval in milliseconds (0 = disabled)
    #[serde(default)]
    pub verify_interval_ms: u64,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub connection: ConnectOptions,
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Config {
    /// Config with defaults for everything but the monitors and group.
    pub fn new(monitors: Vec<MonitorAddress>, group: impl Into<String>) -> Self {
        Self {
            monitors,
            group: group.into(),
            role: Role::default(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            verify_interval_ms: 0,
            log: LogConfig::default(),
            connection: ConnectOptions::default(),
        }
    }

    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FailoverError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FailoverError::Config(e.to_string()))
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    /// `None` means retries back off without bound.
    pub fn backoff_max(&self) -> Option<Duration> {
        non_zero_millis(self.backoff_max_ms)
    }

    /// `None` means periodic role verification is disabled.
    pub fn verify_interval(&self) -> Option<Duration> {
        non_zero_millis(self.verify_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitors.is_empty() {
            return Err(FailoverError::Config("At least one monitor is required".into()));
        }
        for monitor in &self.monitors {
            if monitor.host.trim().is_empty() {
                return Err(FailoverError::Config("Monitor host must not be empty".into()));
            }
            if monitor.port == 0 {
                return Err(FailoverError::Config(format!(
                    "Monitor {} has port 0",
                    monitor
                )));
            }
        }
        if self.group.trim().is_empty() {
            return Err(FailoverError::Config("Group name must not be empty".into()));
        }
        if self.backoff_initial_ms == 0 {
            return Err(FailoverError::Config("backoff_initial_ms must be > 0".into()));
        }
        if self.backoff_max_ms > 0 && self.backoff_initial_ms > self.backoff_max_ms {
            return Err(FailoverError::Config(format!(
                "backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = Config::from_toml_str(
            r#"
group = "cache"
monitors = [{ host = "10.0.0.1", port = 26379 }]
"#,
        )
        .unwrap();

        assert_eq!(config.role, Role::Primary);
        assert_eq!(config.backoff_initial(), Duration::from_millis(500));
        assert_eq!(config.backoff_max(), Some(Duration::from_millis(30_000)));
        assert_eq!(config.verify_interval(), None);
        assert_eq!(config.log, LogConfig::default());
        assert_eq!(config.connection.connect_timeout(), Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_toml() {
        let config = Config::from_toml_str(
            r#"
group = "sessions"
role = "replica"
backoff_initial_ms = 100
backoff_max_ms = 0
verify_interval_ms = 2000

[[monitors]]
host = "m1"
port = 26379

[[monitors]]
host = "m2"
port = 26380

[log]
disconnection = "warn"
failed_connection = "off"

[connection]
password = "secret"
database = 3
request_timeout_ms = 0
"#,
        )
        .unwrap();

        assert_eq!(config.role, Role::Replica);
        assert_eq!(config.monitors[1], MonitorAddress::new("m2", 26380));
        assert_eq!(config.backoff_max(), None);
        assert_eq!(config.verify_interval(), Some(Duration::from_secs(2)));
        assert_eq!(config.log.disconnection, LogSeverity::Warning);
        assert_eq!(config.log.failed_connection, LogSeverity::Off);
        assert_eq!(config.log.reconnection, LogSeverity::Info);
        assert_eq!(config.connection.database, Some(3));
        assert_eq!(config.connection.request_timeout(), None);
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let mut config = Config::new(vec![], "g");
        assert!(config.validate().is_err());

        config.monitors = vec![MonitorAddress::new("m1", 0)];
        assert!(config.validate().is_err());

        config.monitors = vec![MonitorAddress::new("m1", 26379)];
        config.group = " ".into();
        assert!(config.validate().is_err());

        config.group = "g".into();
        config.backoff_initial_ms = 40_000;
        assert!(config.validate().is_err());

        config.backoff_max_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_addresses_and_roles() {
        let monitor: MonitorAddress = "sentinel-1.local:26379".parse().unwrap();
        assert_eq!(monitor, MonitorAddress::new("sentinel-1.local", 26379));
        assert!("no-port".parse::<MonitorAddress>().is_err());
        assert!("host:99999".parse::<MonitorAddress>().is_err());

        assert_eq!("master".parse::<Role>().unwrap(), Role::Primary);
        assert_eq!("Replica".parse::<Role>().unwrap(), Role::Replica);
        assert_eq!(Role::Replica.wire_name(), "slave");
    }

    #[test]
    fn test_monitor_options_drop_credentials() {
        let options = ConnectOptions {
            password: Some("pw".into()),
            database: Some(2),
            ..Default::default()
        };
        let monitor = options.for_monitor();
        assert_eq!(monitor.password, None);
        assert_eq!(monitor.database, None);
        assert_eq!(monitor.connect_timeout_ms, options.connect_timeout_ms);
    }
}
