//! Error types for the download module.
//!
//! Network-level failures carry the protocol, the operation that failed,
//! and whether the failure is transient; the retry classifier builds on
//! those fields. Validation and resource-missing failures have dedicated
//! variants so callers can match on them at the boundary.

use std::path::PathBuf;

use thiserror::Error;

use super::protocol::Protocol;

/// Errors that can occur during download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// `download`/`resume` was called before a successful `probe`.
    #[error("probe required before starting a {protocol} transfer")]
    ProbeRequired {
        /// The protocol of the downloader.
        protocol: Protocol,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// No downloader factory is registered for the URL scheme.
    #[error("unsupported scheme: {scheme}")]
    UnsupportedScheme {
        /// The lowercased scheme.
        scheme: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429/503 responses).
        retry_after: Option<String>,
    },

    /// Network-level error from the HTTP transport.
    #[error("network error during {op} on {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The operation in flight.
        op: &'static str,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Protocol-level failure with explicit transience.
    #[error("{protocol} {op} failed: {message}")]
    Protocol {
        /// Protocol the failure belongs to.
        protocol: Protocol,
        /// The operation that failed (e.g. `login`, `retr`, `open`).
        op: &'static str,
        /// Stringified cause.
        message: String,
        /// Whether the failure is worth retrying.
        transient: bool,
    },

    /// File system error (create, write, seek, remove).
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The server refused the requested byte range.
    #[error("server rejected ranged request for {url}")]
    RangeNotSupported {
        /// The URL whose range request was refused.
        url: String,
    },

    /// A part staging file or segment directory required for resume is gone.
    #[error("download data missing at {path}")]
    DataMissing {
        /// The missing path.
        path: PathBuf,
    },

    /// A single-stream destination file required for resume is gone.
    #[error("destination file missing at {path}")]
    DestinationMissing {
        /// The missing path.
        path: PathBuf,
    },

    /// The operation was cancelled by a stop request.
    #[error("operation cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Creates a transient protocol failure.
    pub fn transient(
        protocol: Protocol,
        op: &'static str,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Protocol {
            protocol,
            op,
            message: message.to_string(),
            transient: true,
        }
    }

    /// Creates a permanent protocol failure.
    pub fn permanent(
        protocol: Protocol,
        op: &'static str,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Protocol {
            protocol,
            op,
            message: message.to_string(),
            transient: false,
        }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, op: &'static str, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            op,
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Whether retrying this error could plausibly succeed.
    ///
    /// The retry classifier refines this with message inspection; this
    /// method only reflects variant-level knowledge.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::HttpStatus { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            Self::Io { source, .. } => io_kind_is_transient(source),
            Self::Protocol { transient, .. } => *transient,
            Self::ProbeRequired { .. }
            | Self::InvalidUrl { .. }
            | Self::UnsupportedScheme { .. }
            | Self::RangeNotSupported { .. }
            | Self::DataMissing { .. }
            | Self::DestinationMissing { .. }
            | Self::Cancelled => false,
        }
    }

    /// The Retry-After header value attached to this error, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

/// Socket-level error kinds that indicate a connection worth retrying.
pub(crate) fn io_kind_is_transient(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::BrokenPipe
            | ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable
            | ErrorKind::UnexpectedEof
    )
}
