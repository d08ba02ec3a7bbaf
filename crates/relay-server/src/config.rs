//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - A TOML file (`--config <path>`, or the first of the default paths found)
//! - Environment variables (`RELAY_*`, `__` separating nested keys)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tenvis_relay_core::{Application, StaticAppRegistry};
use tenvis_relay_transport::SessionConfig;

/// Files searched when no path is given.
const DEFAULT_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Heartbeat and write timing.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Tenant applications.
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Inactivity interval advertised to clients, in seconds.
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout_secs: u64,

    /// Read deadline in seconds. Pings go out at 60% of it.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    /// Per-write timeout in seconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-connection outbound queue capacity.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// One tenant application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub id: String,
    pub key: String,
    pub secret: String,

    /// Display name, defaults to the id.
    #[serde(default)]
    pub name: String,

    /// Maximum concurrent connections, 0 for unlimited.
    #[serde(default)]
    pub capacity: usize,

    /// Allow `client-` events between subscribers of private channels.
    #[serde(default)]
    pub enable_client_messages: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6001
}

fn default_true() -> bool {
    true
}

fn default_activity_timeout() -> u64 {
    120
}

fn default_pong_wait() -> u64 {
    120
}

fn default_write_wait() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    100 * 1024 // 100 KiB
}

fn default_outbound_buffer() -> usize {
    1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: default_activity_timeout(),
            pong_wait_secs: default_pong_wait(),
            write_wait_secs: default_write_wait(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl AppConfig {
    fn to_application(&self) -> Application {
        Application::new(self.id.as_str(), self.key.as_str(), self.secret.as_str())
            .with_name(self.name.as_str())
            .with_capacity(self.capacity)
            .with_client_messages(self.enable_client_messages)
    }
}

impl Config {
    /// Load and validate configuration.
    ///
    /// Reads `path` if given, otherwise the first default path that exists,
    /// then applies `RELAY_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be parsed, a value has the wrong
    /// type, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let expanded = expand(path);
                if !expanded.exists() {
                    bail!("Config file not found: {}", expanded.display());
                }
                Some(expanded)
            }
            None => DEFAULT_PATHS
                .iter()
                .map(|p| expand(Path::new(p)))
                .find(|p| p.exists()),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading config file");
            let name = file.to_string_lossy();
            builder = builder.add_source(File::new(name.as_ref(), FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or validation fails.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check the constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error for the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.apps.is_empty() {
            bail!("At least one application must be configured");
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for (index, app) in self.apps.iter().enumerate() {
            if app.id.is_empty() || app.key.is_empty() || app.secret.is_empty() {
                bail!("Application #{index} needs a non-empty id, key and secret");
            }
            if !ids.insert(app.id.as_str()) {
                bail!("Duplicate application id: {}", app.id);
            }
            if !keys.insert(app.key.as_str()) {
                bail!("Duplicate application key: {}", app.key);
            }
        }

        if self.heartbeat.pong_wait_secs == 0 {
            bail!("heartbeat.pong_wait_secs must be greater than zero");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}", self.server.host))
    }

    /// Build the application registry.
    ///
    /// # Errors
    ///
    /// Returns an error if two applications share an id or key.
    pub fn registry(&self) -> Result<StaticAppRegistry> {
        StaticAppRegistry::new(self.apps.iter().map(AppConfig::to_application))
            .context("Invalid application list")
    }

    /// Session timing and limits for the transport.
    #[must_use]
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            activity_timeout: Duration::from_secs(self.heartbeat.activity_timeout_secs),
            pong_wait: Duration::from_secs(self.heartbeat.pong_wait_secs),
            write_wait: Duration::from_secs(self.heartbeat.write_wait_secs),
            max_message_size: self.limits.max_message_size,
            outbound_buffer: self.limits.outbound_buffer,
        }
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
