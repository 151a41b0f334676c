//! Binary persistence for the item catalogue.
//!
//! `ManagerData` is encoded as a MessagePack struct-map stream: field
//! names travel with the record, so fields keep their order, newer
//! decoders zero-initialize fields missing from older files (a record
//! without a protocol field decodes as HTTP), and runtime-only fields
//! are never emitted. Writes are crash-atomic: encode to a sibling temp
//! file, then rename into place.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::item::Item;
use crate::fsutil::{self, MoveError};

/// The persisted root of the Manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerData {
    /// Items keyed by hash.
    #[serde(default)]
    pub items: BTreeMap<String, Item>,
    /// Opaque queue snapshot owned by the scheduling layer.
    #[serde(default)]
    pub queue_state: Option<Vec<u8>>,
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Encoding the catalogue failed.
    #[error("failed to encode user data: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Decoding the catalogue failed (corrupt or truncated file).
    #[error("failed to decode user data from {path}: {source}")]
    Decode {
        /// The file being decoded.
        path: PathBuf,
        /// The underlying decode error.
        #[source]
        source: rmp_serde::decode::Error,
    },

    /// Reading or writing the file failed.
    #[error("user data IO error at {path}: {source}")]
    Io {
        /// The file being accessed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Moving the temp file into place failed.
    #[error(transparent)]
    Move(#[from] MoveError),
}

/// Encodes the catalogue as a named-field binary stream.
///
/// # Errors
///
/// Returns [`PersistError::Encode`] when serialization fails.
pub fn encode(data: &ManagerData) -> Result<Vec<u8>, PersistError> {
    let mut buf = Vec::new();
    let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
    data.serialize(&mut serializer)?;
    Ok(buf)
}

/// Decodes a catalogue; fields absent from older files take their
/// zero defaults.
///
/// # Errors
///
/// Returns [`PersistError::Decode`] for corrupt input.
pub fn decode(path: &Path, bytes: &[u8]) -> Result<ManagerData, PersistError> {
    rmp_serde::from_slice(bytes).map_err(|source| PersistError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the catalogue; a missing file is an empty catalogue.
///
/// # Errors
///
/// Returns IO and decode variants of [`PersistError`].
pub fn load(path: &Path) -> Result<ManagerData, PersistError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no user data file; starting empty");
            return Ok(ManagerData::default());
        }
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    decode(path, &bytes)
}

/// Saves the catalogue crash-atomically: write a sibling temp file,
/// flush it, then rename over the target.
///
/// # Errors
///
/// Returns encode, IO, and move variants of [`PersistError`].
pub fn save(path: &Path, data: &ManagerData) -> Result<(), PersistError> {
    let bytes = encode(data)?;
    let tmp_path = temp_path(path);

    let mut file = std::fs::File::create(&tmp_path).map_err(|source| PersistError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    file.write_all(&bytes).map_err(|source| PersistError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    file.sync_all().map_err(|source| PersistError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    drop(file);

    fsutil::move_file(&tmp_path, path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "user data saved");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| "userdata.warp".to_string(), |n| n.to_string_lossy().into_owned());
    name.push_str(".tmp");
    path.with_file_name(name)
}
