//! Configuration management for the MCP tool host
//!
//! Handles the config file, environment overrides, and validation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError as FieldError};

use crate::error::{ConfigError, Result};
use crate::utils::slugify;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "MCP_TOOLHOST_";

/// Where the source of the server lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Repository {
    #[validate(url)]
    pub url: String,

    /// Hosting service, e.g. "github"
    pub source: String,

    #[serde(default)]
    pub id: String,
}

/// A published package of this server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub registry_name: String,
    pub name: String,
    pub version: String,
}

/// A hosted endpoint of this server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub transport_type: String,
    pub url: String,
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,

    pub port: u16,

    /// Path of the legacy SSE event stream
    #[validate(custom = "validate_route")]
    pub sse_path: String,

    /// Path clients POST to when using the legacy SSE transport
    #[validate(custom = "validate_route")]
    pub message_path: String,

    /// Path of the streamable HTTP endpoint
    #[validate(custom = "validate_route")]
    pub http_path: String,

    /// Answer streamable HTTP POSTs with one JSON body instead of an SSE stream
    pub json_response: bool,

    /// Serve streamable HTTP without session ids
    pub stateless: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4111,
            sse_path: "/sse".to_string(),
            message_path: "/message".to_string(),
            http_path: "/mcp".to_string(),
            json_response: false,
            stateless: false,
        }
    }
}

fn validate_route(path: &str) -> std::result::Result<(), FieldError> {
    if path.starts_with('/') && !path.contains('?') {
        Ok(())
    } else {
        Err(FieldError::new("route must start with '/' and carry no query"))
    }
}

/// Configuration for the MCP tool host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Human-readable server name, also reported as `serverInfo.name`
    #[validate(length(min = 1))]
    pub name: String,

    pub version: String,

    /// Stable id; derived from the name when unset
    pub id: Option<String>,

    pub description: Option<String>,

    /// Sent to clients in the initialize result
    pub instructions: Option<String>,

    #[validate]
    pub repository: Option<Repository>,

    /// RFC 3339; defaults to process start
    pub release_date: Option<String>,

    pub is_latest: bool,

    pub package_canonical: Option<String>,

    pub packages: Vec<PackageInfo>,

    pub remotes: Vec<RemoteInfo>,

    /// Timeout for server-to-client requests such as elicitation
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,

    #[validate]
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mcp-toolhost".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            id: None,
            description: None,
            instructions: None,
            repository: None,
            release_date: None,
            is_latest: true,
            package_canonical: None,
            packages: Vec::new(),
            remotes: Vec::new(),
            request_timeout_ms: 60_000,
            transport: TransportConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, else the default location if present, else defaults.
    /// Environment overrides are applied and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env()?;
        config.check()?;
        Ok(config)
    }

    /// Parse a TOML file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// `<config dir>/mcp-toolhost/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mcp-toolhost").join("config.toml"))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Apply overrides from `lookup`, keyed without the prefix (`NAME`, `HOST`, `PORT`, `TIMEOUT_MS`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("NAME") {
            self.name = name;
        }
        if let Some(host) = lookup("HOST") {
            self.transport.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.transport.port = port.parse().map_err(|_| ConfigError::InvalidConfig {
                message: format!("{}PORT must be a port number, got '{}'", ENV_PREFIX, port),
            })?;
        }
        if let Some(timeout) = lookup("TIMEOUT_MS") {
            self.request_timeout_ms = timeout.parse().map_err(|_| ConfigError::InvalidConfig {
                message: format!(
                    "{}TIMEOUT_MS must be a number of milliseconds, got '{}'",
                    ENV_PREFIX, timeout
                ),
            })?;
        }
        Ok(())
    }

    /// Run field validation
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(|e| ConfigError::InvalidConfig {
            message: e.to_string(),
        })?;
        Ok(())
    }

    pub fn resolved_id(&self) -> String {
        match &self.id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => slugify(&self.name),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.transport.host, self.transport.port);
        addr.parse().map_err(|_| {
            ConfigError::InvalidConfig {
                message: format!("'{}' is not a valid listen address", addr),
            }
            .into()
        })
    }
}
