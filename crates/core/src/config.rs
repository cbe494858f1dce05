// Repository-local configuration.
//
// Lives at `<repo>/.leasehold/config.toml`. Every field has a default, so
// a missing file or a partial file both work.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_DIR: &str = ".leasehold";
pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_DB_FILE: &str = ".leasehold/leasehold.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub locks: LockConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            locks: LockConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Database path, relative to the repository root unless absolute.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: PathBuf::from(DEFAULT_DB_FILE) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Lease lifetime granted on acquire, in seconds.
    pub default_ttl_sec: u64,
    /// Background sweep cadence, in seconds.
    pub cleanup_interval_sec: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { default_ttl_sec: 1800, cleanup_interval_sec: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// How often the working tree is polled for changes, in milliseconds.
    pub poll_interval_ms: u64,
    /// Agent heartbeat cadence, in seconds.
    pub heartbeat_interval_sec: u64,
    /// An agent with no heartbeat for this long is demoted, in seconds.
    pub stale_after_sec: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 1000, heartbeat_interval_sec: 10, stale_after_sec: 90 }
    }
}

impl Config {
    /// Path of the config file under a repository root.
    pub fn path_in(repo_root: impl AsRef<Path>) -> PathBuf {
        repo_root.as_ref().join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load the repository's config, falling back to defaults when the
    /// file does not exist.
    pub fn load(repo_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = Self::path_in(repo_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        toml::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let rendered = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Io { path: parent.to_path_buf(), source })?;
        }
        fs::write(path, rendered)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }

    /// Database path resolved against the repository root.
    pub fn db_path_in(&self, repo_root: impl AsRef<Path>) -> PathBuf {
        if self.store.db_path.is_absolute() {
            self.store.db_path.clone()
        } else {
            repo_root.as_ref().join(&self.store.db_path)
        }
    }
}
