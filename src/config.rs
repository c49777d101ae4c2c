//! Configuration for the jsonq broker.
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line flags. The file layout is:
//!
//! ```toml
//! control = true
//!
//! [server]
//! port = 8765            # or: socket = "/run/jsonq.sock"
//! host = "127.0.0.1"
//! max_line_bytes = 1048576
//! max_pending_lines = 1024  # lines buffered while a pop waits
//!
//! [storage]
//! db = "queue.db"        # in-memory when absent
//! commit_interval_secs = 10
//!
//! [logging]
//! debug = false
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::StoreConfig;
use crate::broker::store::DEFAULT_COMMIT_INTERVAL;
use crate::server::{DEFAULT_MAX_LINE_BYTES, DEFAULT_MAX_PENDING_LINES, Endpoint, ServerConfig};

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Read administrative commands from stdin.
    #[serde(default = "default_control")]
    pub control: bool,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener settings. Exactly one of `port` and `socket` must be set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default)]
    pub socket: Option<PathBuf>,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_max_pending_lines")]
    pub max_pending_lines: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    #[serde(default)]
    pub db: Option<PathBuf>,
    #[serde(default = "default_commit_interval_secs")]
    pub commit_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// Start with verbose tracing on.
    #[serde(default)]
    pub debug: bool,
    /// Emit one JSON object per log event.
    #[serde(default)]
    pub json: bool,
}

fn default_control() -> bool {
    true
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_max_pending_lines() -> usize {
    DEFAULT_MAX_PENDING_LINES
}

fn default_commit_interval_secs() -> u64 {
    DEFAULT_COMMIT_INTERVAL.as_secs()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            control: default_control(),
            server: ServerSection::default(),
            storage: StorageSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: None,
            host: default_host(),
            socket: None,
            max_line_bytes: default_max_line_bytes(),
            max_pending_lines: default_max_pending_lines(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db: None,
            commit_interval_secs: default_commit_interval_secs(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - Fields are unknown or have invalid types
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BrokerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate the merged configuration.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails with one or more errors:
    /// - Neither or both of `server.port` and `server.socket` are set
    /// - `server.port` is 0
    /// - `server.max_line_bytes` or `server.max_pending_lines` is 0
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        match (self.server.port, &self.server.socket) {
            (None, None) => errors.push(
                "No listener configured. Set server.port (--port) or server.socket (--socket)"
                    .to_string(),
            ),
            (Some(_), Some(_)) => errors.push(
                "server.port and server.socket are mutually exclusive; set only one".to_string(),
            ),
            (Some(0), None) => errors.push(
                "Server port cannot be 0. Use a valid port number (1-65535)".to_string(),
            ),
            (Some(port), None) if port < 1024 => warnings.push(format!(
                "Server port {port} is a system/privileged port (< 1024)\n  \
                 Recommendation: Use ports >= 1024 to avoid permission issues"
            )),
            _ => {},
        }

        if let Some(socket) = &self.server.socket {
            if cfg!(not(unix)) {
                errors.push("Unix domain sockets are not supported on this platform".to_string());
            } else if socket.as_os_str().is_empty() {
                errors.push("server.socket cannot be empty".to_string());
            }
        }

        if self.server.max_line_bytes == 0 {
            errors.push(format!(
                "server.max_line_bytes cannot be 0 (default: {DEFAULT_MAX_LINE_BYTES})"
            ));
        }
        if self.server.max_pending_lines == 0 {
            errors.push(format!(
                "server.max_pending_lines cannot be 0 (default: {DEFAULT_MAX_PENDING_LINES})"
            ));
        }

        if let Some(db) = &self.storage.db
            && let Some(parent) = db.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            warnings.push(format!(
                "Database directory does not exist and will be created: {}",
                parent.display()
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }

    /// The endpoint to bind.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable listener is configured.
    pub fn endpoint(&self) -> Result<Endpoint> {
        if let Some(port) = self.server.port {
            return Ok(Endpoint::Tcp(SocketAddr::new(self.server.host, port)));
        }
        #[cfg(unix)]
        if let Some(socket) = &self.server.socket {
            return Ok(Endpoint::Unix(socket.clone()));
        }
        anyhow::bail!("No listener configured")
    }

    /// Store settings.
    pub fn store_config(&self) -> StoreConfig {
        let store = match &self.storage.db {
            Some(path) => StoreConfig::file(path.clone()),
            None => StoreConfig::memory(),
        };
        store.with_commit_interval(Duration::from_secs(self.storage.commit_interval_secs))
    }

    /// Everything [`crate::server::Server::start`] needs.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable listener is configured.
    pub fn server_config(&self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            endpoint: self.endpoint()?,
            store: self.store_config(),
            max_line_bytes: self.server.max_line_bytes,
            max_pending_lines: self.server.max_pending_lines,
        })
    }
}
