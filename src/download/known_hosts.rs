//! Trust-on-first-use SSH host key store.
//!
//! A dedicated known-hosts file under the config directory holds one
//! OpenSSH-style line per host: `<name> <algorithm> <base64-key>`. The
//! first observed key is appended and subsequently enforced; a changed
//! key is rejected with a warning naming the file and the new
//! fingerprint, and the file is left untouched. Entry names normalize
//! the default port 22 away; other ports use the `[host]:port` form.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Serializes appends (and the read-check-append sequence) process-wide.
static KNOWN_HOSTS_LOCK: Mutex<()> = Mutex::new(());

/// Errors from the host key store.
#[derive(Debug, Error)]
pub enum KnownHostsError {
    /// Reading the store failed.
    #[error("failed to read known hosts file {path}: {source}")]
    Read {
        /// Store path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Appending to the store failed.
    #[error("failed to update known hosts file {path}: {source}")]
    Write {
        /// Store path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The host presented a key different from the pinned one.
    #[error(
        "WARNING: remote host key changed for {host}; {path} pins a different key \
         (offered key fingerprint: {fingerprint}). This may indicate a \
         man-in-the-middle attack; remove the entry only if the change is expected."
    )]
    HostKeyChanged {
        /// Normalized host entry name.
        host: String,
        /// Store path holding the conflicting entry.
        path: PathBuf,
        /// Fingerprint of the newly offered key.
        fingerprint: String,
    },
}

/// Trust-on-first-use store over a single known-hosts file.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    /// Opens a store at the given path; the file is created lazily on
    /// the first accepted key.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Normalized entry name: bare host for port 22, `[host]:port`
    /// otherwise.
    #[must_use]
    pub fn entry_name(host: &str, port: u16) -> String {
        if port == 22 {
            host.to_string()
        } else {
            format!("[{host}]:{port}")
        }
    }

    /// Verifies an offered key against the store.
    ///
    /// - Existing entry with the same key: accept.
    /// - Existing entry with a different key: reject; the file is not
    ///   modified.
    /// - No entry: accept and append, serialized under a process-wide
    ///   lock.
    ///
    /// # Errors
    ///
    /// Returns [`KnownHostsError::HostKeyChanged`] on a pin conflict and
    /// IO variants when the store cannot be read or updated.
    pub fn verify(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        key_base64: &str,
        fingerprint: &str,
    ) -> Result<(), KnownHostsError> {
        let _guard = KNOWN_HOSTS_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let name = Self::entry_name(host, port);
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(KnownHostsError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (Some(entry), Some(entry_alg), Some(entry_key)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if entry != name {
                continue;
            }
            if entry_alg == algorithm && entry_key == key_base64 {
                debug!(host = %name, "host key matches pinned entry");
                return Ok(());
            }
            warn!(host = %name, fingerprint, "host key mismatch against pinned entry");
            return Err(KnownHostsError::HostKeyChanged {
                host: name,
                path: self.path.clone(),
                fingerprint: fingerprint.to_string(),
            });
        }

        // First sighting: pin it.
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| KnownHostsError::Write {
                path: self.path.clone(),
                source,
            })?;
        writeln!(file, "{name} {algorithm} {key_base64}").map_err(|source| {
            KnownHostsError::Write {
                path: self.path.clone(),
                source,
            }
        })?;
        info!(host = %name, fingerprint, "pinned new host key");
        Ok(())
    }
}
