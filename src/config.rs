//! Consumer configuration with documented defaults and deep-merge loading
//!
//! Configuration is assembled in layers: the built-in defaults, then a TOML
//! file, then credential overrides from the environment. Layers are merged
//! field-deep, so an override of `connection.heartbeat` keeps every other
//! `connection.*` default intact.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable overriding `username`
pub const USERNAME_ENV: &str = "WARREN_USERNAME";
/// Environment variable overriding `password`
pub const PASSWORD_ENV: &str = "WARREN_PASSWORD";

/// Fields that must be present (and non-empty) after all layers are merged
const REQUIRED_FIELDS: [&str; 3] = ["host", "username", "password"];

/// Complete consumer configuration, immutable once loaded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Broker host name, also used as the TLS server name
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    /// Declare queues as durable
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub listener: ListenerSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub health: HealthSection,
}

fn default_port() -> u16 {
    5671 // AMQP over TLS
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_durable() -> bool {
    true
}

/// TLS material and policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsSection {
    /// Disable only for local development brokers
    pub enabled: bool,
    /// PEM bundle with the trusted CA certificates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certs: Option<PathBuf>,
    /// PEM client certificate chain for mutual TLS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    /// PEM private key matching `certfile`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
    /// Lowest protocol version that may be negotiated ("TLSv1.2" or "TLSv1.3")
    pub min_version: String,
    pub verify_mode: VerifyMode,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_certs: None,
            certfile: None,
            keyfile: None,
            min_version: "TLSv1.2".to_string(),
            verify_mode: VerifyMode::Required,
        }
    }
}

/// Server certificate verification mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Verify the broker certificate chain against `ca_certs`
    Required,
    /// Accept any broker certificate
    None,
}

/// Connection policy, all durations in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSection {
    pub heartbeat: u64,
    /// Drop a consuming session once the broker has blocked its connection
    /// this long; 0 disables the watch
    pub blocked_connection_timeout: u64,
    /// Socket-level attempts made by one connect call
    pub connection_attempts: u32,
    /// Pause between socket-level attempts
    pub retry_delay: u64,
    pub socket_timeout: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            heartbeat: 600,
            blocked_connection_timeout: 300,
            connection_attempts: 5,
            retry_delay: 5,
            socket_timeout: 10,
        }
    }
}

impl ConnectionSection {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    /// `None` when the blocked-connection watch is disabled
    pub fn blocked_connection_timeout(&self) -> Option<Duration> {
        (self.blocked_connection_timeout > 0)
            .then(|| Duration::from_secs(self.blocked_connection_timeout))
    }
}

/// Listener policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerSection {
    /// Worker slots started by the supervisor
    pub concurrency: u16,
    /// Upper bound for worker slots
    pub max_concurrency: u16,
    /// Unacknowledged deliveries allowed per channel
    pub prefetch_count: u16,
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_concurrency: 10,
            prefetch_count: 1,
        }
    }
}

/// Queue to consume and its optional exchange binding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            name: None,
            exchange: None,
            exchange_kind: ExchangeKind::Direct,
            routing_key: String::new(),
        }
    }
}

/// AMQP exchange types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(name)
    }
}

/// Restart loop timing, all durations in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorSection {
    /// Base delay after a failed connect, doubled per consecutive failure
    pub restart_delay: u64,
    /// Delay after a faulted or dropped session
    pub fault_delay: u64,
    /// Ceiling for the connect-failure backoff
    pub max_restart_delay: u64,
    /// Bound on how long `stop()` waits for workers to exit
    pub stop_timeout: u64,
    /// Period of the status report
    pub status_interval: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            restart_delay: 10,
            fault_delay: 5,
            max_restart_delay: 60,
            stop_timeout: 5,
            status_interval: 30,
        }
    }
}

/// HTTP health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render defaults: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Required field missing after merge: {0}")]
    MissingField(&'static str),
    #[error("Configuration root must be a table")]
    NotATable,
}

/// Deep-merge `overrides` into `base`.
///
/// Tables present on both sides are merged key by key; any other override
/// value replaces the base value outright.
pub fn merge_values(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_table), toml::Value::Table(override_table)) => {
            for (key, value) in override_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, value) => *base = value,
    }
}

impl Config {
    /// Documented defaults as a TOML table. Endpoint and credentials are
    /// intentionally absent.
    pub fn defaults_value() -> Result<toml::Value, ConfigError> {
        let mut table = toml::Table::new();
        table.insert("port".into(), toml::Value::Integer(default_port().into()));
        table.insert(
            "virtual_host".into(),
            toml::Value::String(default_virtual_host()),
        );
        table.insert("durable".into(), toml::Value::Boolean(default_durable()));
        table.insert("tls".into(), toml::Value::try_from(TlsSection::default())?);
        table.insert(
            "connection".into(),
            toml::Value::try_from(ConnectionSection::default())?,
        );
        table.insert(
            "listener".into(),
            toml::Value::try_from(ListenerSection::default())?,
        );
        table.insert("queue".into(), toml::Value::try_from(QueueSection::default())?);
        table.insert(
            "supervisor".into(),
            toml::Value::try_from(SupervisorSection::default())?,
        );
        table.insert(
            "health".into(),
            toml::Value::try_from(HealthSection::default())?,
        );
        Ok(toml::Value::Table(table))
    }

    /// Merge `overrides` into `defaults` and build a configuration.
    ///
    /// Fails only when the merged document lacks an endpoint or credentials,
    /// or when a value has the wrong type.
    pub fn load(defaults: toml::Value, overrides: toml::Value) -> Result<Self, ConfigError> {
        let mut merged = defaults;
        merge_values(&mut merged, overrides);

        let table = merged.as_table().ok_or(ConfigError::NotATable)?;
        for field in REQUIRED_FIELDS {
            let present = match table.get(field) {
                Some(toml::Value::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
                None => false,
            };
            if !present {
                return Err(ConfigError::MissingField(field));
            }
        }

        Ok(merged.try_into()?)
    }

    /// Build a configuration from overrides layered on the built-in defaults
    pub fn from_overrides(overrides: toml::Value) -> Result<Self, ConfigError> {
        Self::load(Self::defaults_value()?, overrides)
    }

    /// Load configuration from a TOML file, then apply environment credentials
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut overrides = toml::Value::Table(toml::from_str::<toml::Table>(&content)?);
        merge_values(&mut overrides, env_overrides(|name| std::env::var(name).ok()));
        Self::from_overrides(overrides)
    }

    /// Copy with the password masked, for display
    pub fn redacted(&self) -> Self {
        Self {
            password: "***".to_string(),
            ..self.clone()
        }
    }

    /// Endpoint URL for log lines; never contains the password
    pub fn display_endpoint(&self) -> String {
        let scheme = if self.tls.enabled { "amqps" } else { "amqp" };
        let fallback = format!(
            "{scheme}://{}@{}:{}/{}",
            self.username, self.host, self.port, self.virtual_host
        );
        let Ok(mut url) = Url::parse(&format!("{scheme}://{}:{}", self.host, self.port)) else {
            return fallback;
        };
        if url.set_username(&self.username).is_err() {
            return fallback;
        }
        // vhost "/" is the empty path segment in AMQP URIs
        url.set_path(&self.virtual_host.replace('/', "%2f"));
        url.to_string()
    }
}

/// Credential overrides read through `lookup` (normally `std::env::var`)
pub fn env_overrides<F>(lookup: F) -> toml::Value
where
    F: Fn(&str) -> Option<String>,
{
    let mut table = toml::Table::new();
    if let Some(username) = lookup(USERNAME_ENV) {
        table.insert("username".into(), toml::Value::String(username));
    }
    if let Some(password) = lookup(PASSWORD_ENV) {
        table.insert("password".into(), toml::Value::String(password));
    }
    toml::Value::Table(table)
}

/// Create a test configuration for unit testing
#[cfg(test)]
pub fn test_config() -> Config {
    let overrides: toml::Table = toml::from_str(
        r#"
host = "broker.test"
username = "guest"
password = "guest"

[tls]
enabled = false

[queue]
name = "orders"
"#,
    )
    .expect("Test config should parse");
    Config::from_overrides(toml::Value::Table(overrides)).expect("Test config should load")
}
