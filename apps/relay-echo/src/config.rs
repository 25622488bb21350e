//! Echo server configuration.
//!
//! Configuration is stored as TOML, read from the path given on the command
//! line or from the platform default:
//! - Linux: `~/.config/tunnelrelay/echo.toml`
//! - Windows: `%APPDATA%/tunnelrelay/echo.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tunnelrelay_listener::ListenerOptions;

/// Echo server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    /// Listener address, e.g. `sb://contoso.example.net/echo`.
    #[serde(default)]
    pub address: String,

    /// Pre-issued listener token (`SharedAccessSignature sr=...`).
    #[serde(default)]
    pub token: String,

    /// How long the token stays valid, in seconds.
    #[serde(default = "default_token_lifetime_secs")]
    pub token_lifetime_secs: u64,

    #[serde(default = "default_connection_buffer_size")]
    pub connection_buffer_size: usize,

    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// When set, rendezvous without this connect header are rejected with 401.
    #[serde(default)]
    pub required_header: Option<String>,
}

fn default_token_lifetime_secs() -> u64 {
    60 * 60
}

fn default_connection_buffer_size() -> usize {
    ListenerOptions::default().connection_buffer_size
}

fn default_operation_timeout_secs() -> u64 {
    ListenerOptions::default().operation_timeout.as_secs()
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            token: String::new(),
            token_lifetime_secs: default_token_lifetime_secs(),
            connection_buffer_size: default_connection_buffer_size(),
            operation_timeout_secs: default_operation_timeout_secs(),
            required_header: None,
        }
    }
}

impl EchoConfig {
    /// Loads configuration from `path` (or the default path). A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: EchoConfig = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            tracing::warn!(path = %path.display(), "configuration file not found, using defaults");
            Ok(EchoConfig::default())
        }
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            connection_buffer_size: self.connection_buffer_size,
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            token_validity: self.token_lifetime(),
            ..ListenerOptions::default()
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("tunnelrelay").join("echo.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("tunnelrelay")
            .join("echo.toml"))
    }
}
