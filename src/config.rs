//! Process environment: config directory layout.
//!
//! Every path the engine touches outside a download's destination lives
//! under one config directory: per-item segment workspaces (`dldata/`),
//! the trust-on-first-use SSH host key store (`known_hosts`), and the
//! persisted item catalogue (`userdata.warp`).
//!
//! The directory is resolved from the `WARPDL_CONFIG_DIR` environment
//! variable when set, otherwise from the platform user-config directory
//! plus `warpdl/`. The resolved layout is carried as an explicit
//! [`Environment`] value rather than process-global state so tests and
//! embedders can point the engine anywhere.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Environment variable overriding the config directory location.
pub const CONFIG_DIR_ENV: &str = "WARPDL_CONFIG_DIR";

/// Application subdirectory under the platform config dir.
const APP_DIR_NAME: &str = "warpdl";

/// Subdirectory holding per-item segment workspaces.
const DATA_DIR_NAME: &str = "dldata";

/// Trust-on-first-use SSH host key store.
const KNOWN_HOSTS_FILE: &str = "known_hosts";

/// Persisted item catalogue.
const USERDATA_FILE: &str = "userdata.warp";

/// Errors resolving or preparing the config directory.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An empty path was supplied (or the override variable was blank).
    #[error("config directory path is empty")]
    EmptyPath,

    /// The platform exposes no user-config directory.
    #[error("could not determine a config directory for this platform")]
    NoConfigDir,

    /// Creating the directory tree failed.
    #[error("failed to create {path}: {source}")]
    Create {
        /// The path that could not be created.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Resolved config directory layout shared by the Manager and the
/// protocol downloaders.
#[derive(Debug, Clone)]
pub struct Environment {
    config_dir: PathBuf,
}

impl Environment {
    /// Resolves the environment from `WARPDL_CONFIG_DIR` or the platform
    /// user-config directory, creating any missing parents.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyPath`] when the override variable is
    /// set but blank, [`ConfigError::NoConfigDir`] when the platform has
    /// no config directory, and [`ConfigError::Create`] on IO failure.
    pub fn resolve() -> Result<Self, ConfigError> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if dir.trim().is_empty() {
                return Err(ConfigError::EmptyPath);
            }
            return Self::with_config_dir(dir);
        }
        let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Self::with_config_dir(base.join(APP_DIR_NAME))
    }

    /// Builds an environment rooted at an explicit directory, creating
    /// the directory and its `dldata/` workspace if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyPath`] for an empty path and
    /// [`ConfigError::Create`] when directory creation fails.
    pub fn with_config_dir(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_dir = path.into();
        if config_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        let data_dir = config_dir.join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data_dir).map_err(|source| ConfigError::Create {
            path: data_dir.clone(),
            source,
        })?;
        Ok(Self { config_dir })
    }

    /// The config directory root.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Directory holding per-item segment workspaces.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.config_dir.join(DATA_DIR_NAME)
    }

    /// Segment workspace for one item.
    #[must_use]
    pub fn item_dir(&self, item_hash: &str) -> PathBuf {
        self.data_dir().join(item_hash)
    }

    /// Path of the trust-on-first-use host key store.
    #[must_use]
    pub fn known_hosts_path(&self) -> PathBuf {
        self.config_dir.join(KNOWN_HOSTS_FILE)
    }

    /// Path of the persisted item catalogue.
    #[must_use]
    pub fn userdata_path(&self) -> PathBuf {
        self.config_dir.join(USERDATA_FILE)
    }
}
