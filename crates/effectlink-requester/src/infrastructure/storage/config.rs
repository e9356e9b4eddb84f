//! TOML-based configuration for the requester.
//!
//! Read from `requester.toml` in the platform config directory unless a path
//! is given:
//! - Windows:  `%APPDATA%\effectlink\requester.toml`
//! - Linux:    `~/.config/effectlink/requester.toml`
//! - macOS:    `~/Library/Application Support/effectlink/requester.toml`
//!
//! ```toml
//! [network]
//! mode = "client"
//! remote_host = "192.168.1.20"
//!
//! [requests]
//! timeout_ms = 10000
//! auto_retry = true
//! ```
//!
//! The requester dials out by default, matching the executor's default of
//! listening.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use effectlink_core::protocol::hash_password;
use effectlink_core::session::ConnectionMode;

use crate::application::CorrelatorConfig;
use crate::infrastructure::network::RequesterSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
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

/// Top-level requester configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequesterConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub requests: RequestsConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_mode")]
    pub mode: ConnectionMode,
    /// Address to listen on in server mode.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Executor host to dial in client mode.
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
}

/// Password presented when an executor asks for one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Per-request behaviour of the correlator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestsConfig {
    /// Budget for the first response; absent or 0 disables the timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Resend requests answered with RETRY instead of forwarding the RETRY.
    #[serde(default)]
    pub auto_retry: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Interval of unsolicited keep-alives; 0 disables them.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Wait after a disconnect before failing requests still pending.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_mode() -> ConnectionMode {
    ConnectionMode::Client
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    58430
}
fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}
fn default_max_retries() -> u32 {
    crate::application::correlator::DEFAULT_MAX_RETRIES
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_shutdown_grace_ms() -> u64 {
    1000
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
            mode: default_mode(),
            bind_address: default_bind_address(),
            port: default_port(),
            remote_host: default_remote_host(),
        }
    }
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            auto_retry: false,
            max_retries: default_max_retries(),
            keep_alive_secs: default_keep_alive_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
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

impl RequesterConfig {
    /// The configured password hash, deriving it from `password` if needed.
    pub fn password_hash(&self) -> Option<String> {
        self.auth
            .password_hash
            .as_deref()
            .map(|hash| hash.trim().to_ascii_lowercase())
            .or_else(|| self.auth.password.as_deref().map(hash_password))
    }

    pub fn correlator(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            timeout: self
                .requests
                .timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            auto_retry: self.requests.auto_retry,
            max_retries: self.requests.max_retries,
            shutdown_grace: Duration::from_millis(self.requests.shutdown_grace_ms),
        }
    }

    pub fn settings(&self) -> RequesterSettings {
        RequesterSettings {
            password_hash: self.password_hash(),
            correlator: self.correlator(),
            keep_alive_interval: (self.requests.keep_alive_secs > 0)
                .then(|| Duration::from_secs(self.requests.keep_alive_secs)),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.network.port)
    }

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
        .map(|dir| dir.join("requester.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, or at [`config_file_path`] when `None`.
/// A missing file yields [`RequesterConfig::default`].
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<RequesterConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RequesterConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config(config: &RequesterConfig, path: &Path) -> Result<(), ConfigError> {
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
