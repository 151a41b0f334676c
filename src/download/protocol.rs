//! The uniform contract implemented by every protocol downloader.
//!
//! The engine consumes downloaders through `probe` → `download` /
//! `resume`, plus capabilities, cancellation, and metadata accessors.
//! Implementations: HTTP (parallel), FTP/FTPS (single-stream), SFTP
//! (single-stream over SSH).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::DownloadError;
use super::handlers::EventHandlers;
use super::retry::RetryConfig;
use crate::headers::Headers;
use crate::manager::ItemPart;

/// Wire protocol of a download. The numeric encoding is stable: records
/// persisted before this field existed decode as HTTP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Protocol {
    /// HTTP or HTTPS (parallelizable).
    #[default]
    Http,
    /// Plain FTP (single-stream).
    Ftp,
    /// FTP over TLS (single-stream).
    Ftps,
    /// SFTP over an SSH transport (single-stream).
    Sftp,
}

impl Protocol {
    /// Maps a lowercased URL scheme onto a protocol.
    #[must_use]
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" | "https" => Some(Self::Http),
            "ftp" => Some(Self::Ftp),
            "ftps" => Some(Self::Ftps),
            "sftp" => Some(Self::Sftp),
            _ => None,
        }
    }
}

impl From<Protocol> for u8 {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Http => 0,
            Protocol::Ftp => 1,
            Protocol::Ftps => 2,
            Protocol::Sftp => 3,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Http),
            1 => Ok(Self::Ftp),
            2 => Ok(Self::Ftps),
            3 => Ok(Self::Sftp),
            other => Err(format!("invalid protocol code: {other}")),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::Ftp => "ftp",
            Self::Ftps => "ftps",
            Self::Sftp => "sftp",
        };
        write!(f, "{name}")
    }
}

/// Signed byte count; `-1` means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentLength(pub i64);

impl ContentLength {
    /// The unknown sentinel.
    pub const UNKNOWN: Self = Self(-1);

    /// A known byte count.
    #[must_use]
    pub fn known(bytes: i64) -> Self {
        Self(bytes)
    }

    /// Whether the count is known.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.0 >= 0
    }

    /// The raw signed value.
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// The count as unsigned, when known.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn as_u64(&self) -> Option<u64> {
        self.is_known().then_some(self.0 as u64)
    }
}

impl std::fmt::Display for ContentLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_known() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "unknown")
        }
    }
}

/// Optional checksum metadata surfaced by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    /// Checksum algorithm name (e.g. `md5`).
    pub algorithm: String,
    /// Encoded checksum value as the server supplied it.
    pub value: String,
}

/// Metadata obtained by a probe round trip.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Remote file name.
    pub file_name: String,
    /// Total size, `-1` when unknown.
    pub content_length: ContentLength,
    /// Whether ranged/offset transfers are supported.
    pub resumable: bool,
    /// Checksums advertised by the remote, if any.
    pub checksums: Vec<Checksum>,
}

/// What a protocol implementation can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether ranges can be fetched in parallel.
    pub supports_parallel: bool,
    /// Whether interrupted transfers can resume.
    pub supports_resume: bool,
}

/// Cancellation handle detached from the running downloader, so the
/// Manager can stop a transfer it no longer owns.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    /// Creates a fresh handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a halt; non-blocking, idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Whether a stop was requested. Monotonic once true.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The cancellation token observed by transfer loops.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Construction options shared by all downloader factories.
#[derive(Debug, Clone, Default)]
pub struct DownloaderOptions {
    /// Reuse an existing item hash (resume) instead of deriving one.
    pub hash: Option<String>,
    /// Override the probed file name.
    pub file_name: Option<String>,
    /// Extra request headers.
    pub headers: Headers,
    /// Destination directory; defaults to the platform download dir.
    pub save_dir: Option<PathBuf>,
    /// Cap on concurrently running part connections.
    pub max_connections: Option<usize>,
    /// Cap on the number of planned parts.
    pub max_parts: Option<usize>,
    /// Override the minimum part size chosen from the size table.
    pub min_part_size: Option<i64>,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Explicit SSH private key path (SFTP only).
    pub key_path: Option<PathBuf>,
}

/// The contract consumed by the engine and the Manager.
///
/// `probe` MUST be called (successfully) before `download` or `resume`.
/// `download`/`resume` return `Ok(())` when a stop was requested before
/// or during the transfer; completion is signaled through the handler
/// surface instead of the return value.
#[async_trait]
pub trait ProtocolDownloader: Send {
    /// Fetches remote metadata. May make network calls.
    async fn probe(&mut self) -> Result<ProbeResult, DownloadError>;

    /// Starts a fresh transfer, reporting through `handlers`.
    async fn download(&mut self, handlers: EventHandlers) -> Result<(), DownloadError>;

    /// Resumes from the persisted parts map. When every given part is
    /// already compiled the call returns immediately.
    async fn resume(
        &mut self,
        parts: BTreeMap<i64, ItemPart>,
        handlers: EventHandlers,
    ) -> Result<(), DownloadError>;

    /// Static capabilities of this protocol path.
    fn capabilities(&self) -> Capabilities;

    /// Detached stop handle for this downloader.
    fn stop_handle(&self) -> StopHandle;

    /// Requests a halt; non-blocking.
    fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Whether a stop was requested. Monotonic once true.
    fn is_stopped(&self) -> bool {
        self.stop_handle().is_stopped()
    }

    /// Releases every held resource; idempotent.
    async fn close(&mut self);

    /// Item hash of this download.
    fn hash(&self) -> &str;

    /// Resolved file name.
    fn file_name(&self) -> &str;

    /// Segment workspace directory.
    fn download_directory(&self) -> PathBuf;

    /// Final destination path.
    fn save_path(&self) -> PathBuf;

    /// Probed total size.
    fn content_length(&self) -> ContentLength;

    /// Cap on concurrent part connections.
    fn max_connections(&self) -> usize;

    /// Cap on planned parts.
    fn max_parts(&self) -> usize;
}
