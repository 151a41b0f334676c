//! Error types for the Manager.

use thiserror::Error;

use super::persist::PersistError;
use crate::config::ConfigError;
use crate::download::DownloadError;

/// Errors surfaced by the Manager at the boundary.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No item with the given hash exists.
    #[error("download not found")]
    DownloadNotFound,

    /// The segment workspace or a part staging file required for resume
    /// is gone; the caller must rebuild state or start fresh.
    #[error("download data missing; start the download again")]
    DownloadDataMissing,

    /// Flush requested for a hash that does not exist.
    #[error("no download found for the given hash")]
    FlushHashNotFound,

    /// Flush requested while the item is still downloading.
    #[error("cannot flush an item that is still downloading")]
    FlushItemDownloading,

    /// A cookie file could not be read or parsed.
    #[error("failed to load cookies from {path}: {reason}")]
    CookieFile {
        /// The cookie file path.
        path: std::path::PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Persistence failed.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// A protocol downloader failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The config directory is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
