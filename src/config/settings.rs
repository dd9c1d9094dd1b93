//! Proxy server configuration settings

use crate::error::{Error, Result};
use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: &str = "1080";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HEADER_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_IDLE_PER_HOST: usize = 16;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 90;

/// Startup options as given on the command line or in a YAML file.
///
/// `None` means the option was not given and its default applies; an empty
/// string is an explicit empty value (an empty `port` disables the plaintext
/// listener).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// TLS certificate chain (PEM)
    pub cert: Option<String>,

    /// TLS private key (PEM)
    pub key: Option<String>,

    /// Bind address shared by both listeners
    pub bind: Option<String>,

    /// Plaintext listener port
    #[serde(deserialize_with = "port_value")]
    pub port: Option<String>,

    /// TLS listener port
    #[serde(deserialize_with = "port_value")]
    pub https_port: Option<String>,

    pub auth_username: Option<String>,
    pub auth_password: Option<String>,

    /// Upstream dial timeout in seconds
    pub connect_timeout: Option<u64>,

    /// Request head / TLS handshake timeout in seconds
    pub header_read_timeout: Option<u64>,

    /// Idle upstream connections kept per origin
    pub max_idle_per_host: Option<usize>,

    /// Idle upstream connection lifetime in seconds
    pub idle_timeout: Option<u64>,
}

/// Ports may be written as YAML numbers or strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

fn port_value<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<PortValue>::deserialize(deserializer)?;
    Ok(value.map(|value| match value {
        PortValue::Number(number) => number.to_string(),
        PortValue::Text(text) => text,
    }))
}

/// Basic-auth credentials configured at startup
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls { cert: PathBuf, key: PathBuf },
}

impl Transport {
    /// Name used in bind log lines
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Plain => "http",
            Transport::Tls { .. } => "https",
        }
    }
}

/// One socket the supervisor binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDescriptor {
    pub bind_address: String,
    pub port: u16,
    pub transport: Transport,
}

impl ListenerDescriptor {
    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }
}

/// Settings for outbound connections
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

/// Settings for client sessions
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Limit for receiving a request head, also the keep-alive idle limit
    pub header_read_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            header_read_timeout: Duration::from_secs(DEFAULT_HEADER_READ_TIMEOUT_SECS),
        }
    }
}

/// Resolved, immutable startup plan handed to the supervisor
#[derive(Debug, Clone)]
pub struct StartupPlan {
    pub listeners: Vec<ListenerDescriptor>,
    pub auth: Option<Credentials>,
    pub upstream: UpstreamSettings,
    pub session: SessionSettings,
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: ProxyConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Layer `overrides` on top of `self`; options set in `overrides` win.
    pub fn merge(self, overrides: ProxyConfig) -> ProxyConfig {
        ProxyConfig {
            cert: overrides.cert.or(self.cert),
            key: overrides.key.or(self.key),
            bind: overrides.bind.or(self.bind),
            port: overrides.port.or(self.port),
            https_port: overrides.https_port.or(self.https_port),
            auth_username: overrides.auth_username.or(self.auth_username),
            auth_password: overrides.auth_password.or(self.auth_password),
            connect_timeout: overrides.connect_timeout.or(self.connect_timeout),
            header_read_timeout: overrides.header_read_timeout.or(self.header_read_timeout),
            max_idle_per_host: overrides.max_idle_per_host.or(self.max_idle_per_host),
            idle_timeout: overrides.idle_timeout.or(self.idle_timeout),
        }
    }

    /// Decide which listeners and gates are active.
    pub fn resolve(&self) -> Result<StartupPlan> {
        let bind = trimmed(&self.bind).unwrap_or(DEFAULT_BIND).to_string();
        let mut listeners = Vec::new();

        let port = self.port.as_deref().unwrap_or(DEFAULT_PORT).trim();
        if !port.is_empty() {
            listeners.push(ListenerDescriptor {
                bind_address: bind.clone(),
                port: parse_port("port", port)?,
                transport: Transport::Plain,
            });
        }

        if let (Some(cert), Some(key), Some(https_port)) =
            (trimmed(&self.cert), trimmed(&self.key), trimmed(&self.https_port))
        {
            listeners.push(ListenerDescriptor {
                bind_address: bind,
                port: parse_port("https-port", https_port)?,
                transport: Transport::Tls {
                    cert: PathBuf::from(cert),
                    key: PathBuf::from(key),
                },
            });
        }

        if listeners.is_empty() {
            return Err(Error::Config(
                "no listener enabled: set --port, or all of --cert, --key and --https-port".to_string(),
            ));
        }

        let auth = match (self.auth_username.as_deref(), self.auth_password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            _ => None,
        };

        let upstream = UpstreamSettings {
            connect_timeout: seconds(
                "connect-timeout",
                self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            )?,
            max_idle_per_host: self.max_idle_per_host.unwrap_or(DEFAULT_MAX_IDLE_PER_HOST),
            idle_timeout: Duration::from_secs(self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)),
        };
        let session = SessionSettings {
            header_read_timeout: seconds(
                "header-read-timeout",
                self.header_read_timeout.unwrap_or(DEFAULT_HEADER_READ_TIMEOUT_SECS),
            )?,
        };

        Ok(StartupPlan {
            listeners,
            auth,
            upstream,
            session,
        })
    }
}

fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

fn parse_port(option: &str, value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| Error::Config(format!("invalid --{} value {:?}: expected 1-65535", option, value)))
}

fn seconds(option: &str, value: u64) -> Result<Duration> {
    if value == 0 {
        return Err(Error::Config(format!("--{} must be at least 1 second", option)));
    }
    Ok(Duration::from_secs(value))
}
