//! Multi-protocol download engine.
//!
//! This module provides the protocol downloaders and their supporting
//! primitives:
//!
//! - A uniform [`ProtocolDownloader`] contract (`probe` →
//!   `download`/`resume`) over a parallel HTTP path and two single-stream
//!   paths (FTP/FTPS, SFTP over SSH with trust-on-first-use host keys)
//! - The segmented HTTP engine: dynamic part planning, per-part resume,
//!   retries, and compilation of part files into the final output
//! - A scheme [`Router`] mapping URLs to downloader factories
//! - Retry classification with exponential backoff and jitter
//! - A shared token-bucket [`SpeedLimiter`]
//! - Supervised task spawning with panic recovery
//!
//! # Example
//!
//! ```no_run
//! use warpdl_core::config::Environment;
//! use warpdl_core::download::{DownloaderOptions, EventHandlers, Router, SpeedLimiter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let env = Environment::resolve()?;
//! let router = Router::new(None, env, SpeedLimiter::unlimited());
//! let mut dl = router.new_downloader(
//!     "https://example.com/big.iso",
//!     DownloaderOptions::default(),
//! )?;
//! let probe = dl.probe().await?;
//! println!("{} ({} bytes)", probe.file_name, probe.content_length);
//! dl.download(EventHandlers::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod constants;
mod error;
mod ftp;
mod handlers;
mod http;
pub mod known_hosts;
mod protocol;
pub mod rate_limiter;
mod retry;
mod router;
mod sftp;
mod spawner;

pub use constants::MAIN_HASH;
pub use error::DownloadError;
pub use ftp::FtpDownloader;
pub use handlers::EventHandlers;
pub use http::HttpDownloader;
pub use known_hosts::{KnownHosts, KnownHostsError};
pub use protocol::{
    Capabilities, Checksum, ContentLength, DownloaderOptions, ProbeResult, Protocol,
    ProtocolDownloader, StopHandle,
};
pub use rate_limiter::{RateLimited, SpeedLimiter, parse_rate_limit};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryConfig, RetryState, classify_error, wait_for_retry,
};
pub use router::Router;
pub use sftp::SftpDownloader;
pub use spawner::{PanicHook, WaitGroup, spawn_supervised};
