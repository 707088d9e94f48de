//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files (`[server]` and `[client]` sections)
//! - Environment variables (`TENSOR_QUERY_*`)
//! - CLI arguments (for the `tensor-query` binary)

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::protocol::{CapabilityDescriptor, NegotiationPolicy};
use crate::server::ServerConfig;

/// Default host for both ends.
pub const DEFAULT_HOST: &str = "localhost";

/// Default port for both ends.
pub const DEFAULT_PORT: u16 = 3001;

/// Default I/O and negotiation timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u32 = 10;

/// Default number of HYBRID discovery attempts.
pub const DEFAULT_DISCOVERY_ATTEMPTS: u32 = 3;

/// Transport used between client and server.
///
/// Numeric values match the historical `connect-type` property values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectType {
    /// Reliable ordered stream (default)
    #[default]
    Tcp = 0,
    /// UDP discovery followed by a TCP stream
    Hybrid = 1,
    /// Connectionless datagrams
    Udp = 2,
}

impl ConnectType {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Hybrid => "HYBRID",
            Self::Udp => "UDP",
        }
    }

    /// Property value.
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for ConnectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConnectType {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tcp" | "0" => Ok(Self::Tcp),
            "hybrid" | "1" => Ok(Self::Hybrid),
            "udp" | "2" => Ok(Self::Udp),
            _ => Err(QueryError::Config(format!("Unknown connect type: {s}"))),
        }
    }
}

/// Where to connect or bind, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Host name or address
    pub host: String,

    /// Port; 0 binds an ephemeral port
    pub port: u16,

    /// Transport selection
    pub connect_type: ConnectType,

    /// I/O and negotiation timeout in seconds
    #[serde(rename = "timeout")]
    pub timeout_secs: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_type: ConnectType::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl EndpointConfig {
    /// Set host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set transport
    pub fn with_connect_type(mut self, connect_type: ConnectType) -> Self {
        self.connect_type = connect_type;
        self
    }

    /// Set timeout in seconds
    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_secs))
    }

    /// `host:port` for logging.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Check the values before connecting or binding.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(QueryError::Config("host must not be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(QueryError::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint
    #[serde(flatten)]
    pub endpoint: EndpointConfig,

    /// Suppress per-frame logging
    pub silent: bool,

    /// HYBRID discovery attempts
    pub discovery_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            silent: true,
            discovery_attempts: DEFAULT_DISCOVERY_ATTEMPTS,
        }
    }
}

impl ClientConfig {
    /// Set host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.endpoint.host = host.into();
        self
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.endpoint.port = port;
        self
    }

    /// Set transport
    pub fn with_connect_type(mut self, connect_type: ConnectType) -> Self {
        self.endpoint.connect_type = connect_type;
        self
    }

    /// Set timeout in seconds
    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.endpoint.timeout_secs = timeout_secs;
        self
    }

    /// Enable or disable per-frame logging
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Set HYBRID discovery attempts
    pub fn with_discovery_attempts(mut self, attempts: u32) -> Self {
        self.discovery_attempts = attempts;
        self
    }

    /// Check the values before connecting.
    pub fn validate(&self) -> Result<()> {
        self.endpoint.validate()?;
        if self.discovery_attempts == 0 {
            return Err(QueryError::Config(
                "discovery_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[server]` section of the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Bind endpoint
    #[serde(flatten)]
    pub endpoint: EndpointConfig,

    /// Capability of the bound pipeline segment
    pub caps: Option<String>,

    /// Treat `0` extents in `caps` as wildcards
    pub allow_wildcard: bool,

    /// Idle sweep period in milliseconds
    pub sweep_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            caps: None,
            allow_wildcard: false,
            sweep_interval_ms: 1000,
        }
    }
}

/// `[client]` section of the config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Client settings
    #[serde(flatten)]
    pub config: ClientConfig,

    /// Capability the client offers
    pub caps: Option<String>,
}

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerSection,

    /// Client configuration
    #[serde(default)]
    pub client: ClientSection,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            QueryError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().overlay_env()
    }

    /// Apply `TENSOR_QUERY_*` variables on top of this config.
    pub fn overlay_env(self) -> Self {
        self.overlay(|key| std::env::var(key).ok())
    }

    /// Apply variables from `lookup` on top of this config.
    ///
    /// Endpoint variables apply to both sections; unparsable values are
    /// ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("TENSOR_QUERY_HOST") {
            self.server.endpoint.host.clone_from(&host);
            self.client.config.endpoint.host = host;
        }
        if let Some(port) = lookup("TENSOR_QUERY_PORT").and_then(|v| v.parse().ok()) {
            self.server.endpoint.port = port;
            self.client.config.endpoint.port = port;
        }
        if let Some(kind) = lookup("TENSOR_QUERY_CONNECT_TYPE").and_then(|v| v.parse().ok()) {
            self.server.endpoint.connect_type = kind;
            self.client.config.endpoint.connect_type = kind;
        }
        if let Some(secs) = lookup("TENSOR_QUERY_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.server.endpoint.timeout_secs = secs;
            self.client.config.endpoint.timeout_secs = secs;
        }
        if let Some(silent) = lookup("TENSOR_QUERY_SILENT").and_then(|v| v.parse().ok()) {
            self.client.config.silent = silent;
        }
        if let Some(caps) = lookup("TENSOR_QUERY_CAPS") {
            self.server.caps = Some(caps.clone());
            self.client.caps = Some(caps);
        }
        self
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tensor-query").join("config.toml"))
    }

    /// Load the default file when present, then overlay the environment.
    pub fn load() -> Result<Self> {
        let base = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        Ok(base.overlay_env())
    }

    /// Client settings.
    pub fn client_config(&self) -> ClientConfig {
        self.client.config.clone()
    }

    /// Capability the client offers, if configured.
    pub fn client_capability(&self) -> Result<Option<CapabilityDescriptor>> {
        self.client.caps.as_deref().map(str::parse).transpose()
    }

    /// Server settings; requires `caps`.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let caps: CapabilityDescriptor = self
            .server
            .caps
            .as_deref()
            .ok_or_else(|| QueryError::Config("server caps not configured".to_string()))?
            .parse()?;
        let policy = NegotiationPolicy {
            allow_wildcard: self.server.allow_wildcard,
        };

        Ok(ServerConfig::new(caps)
            .with_endpoint(self.server.endpoint.clone())
            .with_policy(policy)
            .with_sweep_interval(Duration::from_millis(self.server.sweep_interval_ms.max(1))))
    }
}
