//! Configuration system for Vaultline.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VAULTLINE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/vaultline/config.toml
//!   3. ~/.config/vaultline/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_MAX_PAYLOAD;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultlineConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, host:port.
    pub bind_addr: String,
    /// Concurrent connection cap. Excess connections are closed on accept.
    pub max_connections: usize,
    /// A connection with no complete frame for this long is dropped.
    pub idle_timeout_secs: u64,
    /// Largest payload accepted by the codec.
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for committed backups.
    pub root: PathBuf,
    /// Largest announced ciphertext size accepted. 0 = unlimited.
    ///
    /// A transfer is held in memory until verified, and roughly twice over
    /// while it is decrypted, so peak usage is about
    /// `2 * max_file_size * server.max_connections`.
    pub max_file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Refuse a registration whose username is already taken.
    pub unique_usernames: bool,
    /// Sweep sessions idle longer than this. 0 = never.
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub username: String,
    /// Ciphertext bytes per SendFile message.
    pub chunk_size: usize,
    pub response_timeout_secs: u64,
    /// Where vaultline-ctl keeps its client id and RSA key.
    pub identity_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1357".into(),
            max_connections: 64,
            idle_timeout_secs: 60,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("backups"),
            max_file_size: 256 * 1024 * 1024, // 256 MiB
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            unique_usernames: true,
            session_ttl_secs: 0,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:1357".into(),
            username: String::new(),
            chunk_size: 64 * 1024,
            response_timeout_secs: 30,
            identity_path: config_dir().join("identity.json"),
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RegistryConfig {
    pub fn session_ttl(&self) -> Option<Duration> {
        (self.session_ttl_secs > 0).then(|| Duration::from_secs(self.session_ttl_secs))
    }
}

impl ClientConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("vaultline")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("vaultline")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VaultlineConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            VaultlineConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VAULTLINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&VaultlineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply VAULTLINE_* overrides. `lookup` is `std::env::var` outside tests.
    /// Values that fail to parse are ignored.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("VAULTLINE_SERVER__BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(n) = lookup("VAULTLINE_SERVER__MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.server.max_connections = n;
        }
        if let Some(n) = lookup("VAULTLINE_SERVER__IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.server.idle_timeout_secs = n;
        }
        if let Some(n) = lookup("VAULTLINE_SERVER__MAX_PAYLOAD_BYTES").and_then(|v| v.parse().ok()) {
            self.server.max_payload_bytes = n;
        }
        if let Some(v) = lookup("VAULTLINE_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(n) = lookup("VAULTLINE_STORAGE__MAX_FILE_SIZE").and_then(|v| v.parse().ok()) {
            self.storage.max_file_size = n;
        }
        if let Some(v) = lookup("VAULTLINE_REGISTRY__UNIQUE_USERNAMES") {
            self.registry.unique_usernames = flag(v);
        }
        if let Some(n) = lookup("VAULTLINE_REGISTRY__SESSION_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.registry.session_ttl_secs = n;
        }
        if let Some(v) = lookup("VAULTLINE_CLIENT__SERVER_ADDR") {
            self.client.server_addr = v;
        }
        if let Some(v) = lookup("VAULTLINE_CLIENT__USERNAME") {
            self.client.username = v;
        }
        if let Some(n) = lookup("VAULTLINE_CLIENT__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.client.chunk_size = n;
        }
        if let Some(n) =
            lookup("VAULTLINE_CLIENT__RESPONSE_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.client.response_timeout_secs = n;
        }
        if let Some(v) = lookup("VAULTLINE_CLIENT__IDENTITY_PATH") {
            self.client.identity_path = PathBuf::from(v);
        }
    }
}
