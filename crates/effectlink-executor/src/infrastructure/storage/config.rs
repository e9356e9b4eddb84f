//! TOML-based configuration for the executor.
//!
//! Read from the platform-appropriate config file unless a path is given:
//! - Windows:  `%APPDATA%\effectlink\executor.toml`
//! - Linux:    `~/.config/effectlink/executor.toml`
//! - macOS:    `~/Library/Application Support/effectlink/executor.toml`
//!
//! ```toml
//! [network]
//! mode = "server"
//! bind_address = "127.0.0.1"
//! port = 58430
//!
//! [auth]
//! password = "hunter2"
//! ```
//!
//! Every field has a default, so a missing file or a file that predates a
//! newer field still loads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use effectlink_core::protocol::hash_password;
use effectlink_core::session::ConnectionMode;

use crate::infrastructure::network::ExecutorSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level executor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Which side of the connection the executor takes, and where.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: ConnectionMode,
    /// Address to listen on in server mode.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Requester host to dial in client mode.
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
}

/// Password protection.  `password_hash` wins over `password` when both are set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Lowercase hex SHA-512 of the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Plain password, hashed at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub send_login_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    /// Upper bound of the exponential reconnect delay in client mode.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    58430
}
fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_backoff_secs() -> u64 {
    60
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::default(),
            bind_address: default_bind_address(),
            port: default_port(),
            remote_host: default_remote_host(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password_hash: None,
            password: None,
            send_login_success: default_true(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl ExecutorConfig {
    /// The configured password hash, deriving it from `password` if needed.
    pub fn password_hash(&self) -> Option<String> {
        self.auth
            .password_hash
            .as_deref()
            .map(|hash| hash.trim().to_ascii_lowercase())
            .or_else(|| self.auth.password.as_deref().map(hash_password))
    }

    pub fn settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            password_hash: self.password_hash(),
            send_login_success: self.auth.send_login_success,
        }
    }

    /// `bind_address:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.network.port)
    }

    /// `remote_host:port`.
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.network.remote_host, self.network.port)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect.max_backoff_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("executor.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, or at [`config_file_path`] when `None`.
/// A missing file yields [`ExecutorConfig::default`].
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<ExecutorConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ExecutorConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &ExecutorConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("effectlink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("effectlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("effectlink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
