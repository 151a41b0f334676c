//! File helpers shared by the engine and the persistence layer.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Raw OS error for a cross-device rename.
#[cfg(unix)]
const CROSS_DEVICE_ERRNO: i32 = 18; // EXDEV
#[cfg(windows)]
const CROSS_DEVICE_ERRNO: i32 = 17; // ERROR_NOT_SAME_DEVICE

/// Errors moving a file into place.
#[derive(Debug, Error)]
pub enum MoveError {
    /// Plain rename failure (same filesystem).
    #[error("failed to move {from} to {to}: {source}")]
    Rename {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Rename crossed a device boundary and the copy-and-delete fallback
    /// also failed.
    #[error("cross-device move from {from} to {to} failed: {source}")]
    CrossDeviceMove {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// The error from the copy fallback.
        #[source]
        source: std::io::Error,
    },
}

/// Moves `from` to `to`, escalating a cross-device rename to
/// copy-and-delete. The cross-device error is only surfaced when the
/// fallback copy also fails.
///
/// # Errors
///
/// Returns [`MoveError::Rename`] for ordinary rename failures and
/// [`MoveError::CrossDeviceMove`] when the copy fallback fails.
pub fn move_file(from: &Path, to: &Path) -> Result<(), MoveError> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(CROSS_DEVICE_ERRNO) => {
            std::fs::copy(from, to)
                .and_then(|_| std::fs::remove_file(from))
                .map_err(|source| MoveError::CrossDeviceMove {
                    from: from.to_path_buf(),
                    to: to.to_path_buf(),
                    source,
                })
        }
        Err(source) => Err(MoveError::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        }),
    }
}
