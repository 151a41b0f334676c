//! Warp Download Engine Core Library
//!
//! This library provides the core functionality for the warp download
//! engine: segmented parallel fetching over HTTP(S), single-stream FTP(S)
//! and SFTP transfers, and a durable item catalogue that survives process
//! restarts so interrupted transfers can be resumed later.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Config directory layout (`WARPDL_CONFIG_DIR`, `dldata/`, …)
//! - [`download`] - Protocol downloaders, segmented HTTP engine, retry,
//!   rate limiting, and supervised task spawning
//! - [`headers`] - Ordered header list shared by items and requests
//! - [`manager`] - Durable catalogue of download items with binary
//!   persistence
//!
//! The CLI, daemon, and RPC surfaces live in separate crates and consume
//! this library through the [`manager::Manager`] and
//! [`download::Router`] entry points.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod fsutil;
pub mod headers;
pub mod manager;

// Re-export commonly used types
pub use config::Environment;
pub use download::{
    Capabilities, ContentLength, DownloadError, DownloaderOptions, EventHandlers, FailureType,
    FtpDownloader, HttpDownloader, MAIN_HASH, ProbeResult, Protocol, ProtocolDownloader,
    RetryConfig, RetryState, Router, SftpDownloader, SpeedLimiter, StopHandle, WaitGroup,
    classify_error, parse_rate_limit, spawn_supervised,
};
pub use headers::Headers;
pub use manager::{AddOptions, Item, ItemPart, Manager, ManagerData, ManagerError, ScheduleState};
