//! Notification surface invoked by the protocol downloaders.
//!
//! Every handler is optional; missing handlers are no-ops. Progress
//! notifications are fanned out on supervised tasks so a slow or
//! panicking user callback can never stall or break the data path.

use std::sync::Arc;

use tracing::error;

use super::DownloadError;
use super::spawner::{WaitGroup, spawn_supervised};

type PartFn = Arc<dyn Fn(&str, i64, i64) + Send + Sync>;
type RespawnFn = Arc<dyn Fn(&str, i64, i64, i64) + Send + Sync>;
type ProgressFn = Arc<dyn Fn(&str, u64) + Send + Sync>;
type CompleteFn = Arc<dyn Fn(&str, i64) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&str, &DownloadError) + Send + Sync>;
type HashFn = Arc<dyn Fn(&str) + Send + Sync>;
type UnitFn = Arc<dyn Fn() + Send + Sync>;

/// Optional callbacks a downloader may invoke. All nil-safe.
#[derive(Clone, Default)]
pub struct EventHandlers {
    /// A part worker was spawned for `[init, final]`.
    pub spawn_part: Option<PartFn>,
    /// Reserved: a part's range was re-planned mid-download.
    pub respawn_part: Option<RespawnFn>,
    /// Bytes arrived for a part (or the whole stream).
    pub download_progress: Option<ProgressFn>,
    /// Reserved companion of `download_progress` for resumed transfers.
    pub resume_progress: Option<ProgressFn>,
    /// A transfer finished; `MAIN_HASH` carries the aggregate event.
    pub download_complete: Option<CompleteFn>,
    /// A transfer failed.
    pub error: Option<ErrorFn>,
    /// Compilation of parts into the destination began.
    pub compile_start: Option<HashFn>,
    /// Bytes were spliced into the destination.
    pub compile_progress: Option<ProgressFn>,
    /// An already-compiled part was skipped during resume.
    pub compile_skipped: Option<CompleteFn>,
    /// One part was fully spliced and its staging file removed.
    pub compile_complete: Option<CompleteFn>,
    /// A stop request was honored.
    pub download_stopped: Option<UnitFn>,
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("spawn_part", &self.spawn_part.is_some())
            .field("download_progress", &self.download_progress.is_some())
            .field("download_complete", &self.download_complete.is_some())
            .field("error", &self.error.is_some())
            .finish_non_exhaustive()
    }
}

impl EventHandlers {
    /// Handlers that ignore every event.
    #[must_use]
    pub fn noop() -> Self {
        Self::default()
    }

    /// Chains two handler sets: for each event, `first` runs before
    /// `second`. Used by the Manager to prepend its bookkeeping to the
    /// caller's handlers.
    #[must_use]
    pub fn chain(first: Self, second: Self) -> Self {
        Self {
            spawn_part: chain3(first.spawn_part, second.spawn_part),
            respawn_part: chain4(first.respawn_part, second.respawn_part),
            download_progress: chain_progress(first.download_progress, second.download_progress),
            resume_progress: chain_progress(first.resume_progress, second.resume_progress),
            download_complete: chain_complete(first.download_complete, second.download_complete),
            error: chain_error(first.error, second.error),
            compile_start: chain_hash(first.compile_start, second.compile_start),
            compile_progress: chain_progress(first.compile_progress, second.compile_progress),
            compile_skipped: chain_complete(first.compile_skipped, second.compile_skipped),
            compile_complete: chain_complete(first.compile_complete, second.compile_complete),
            download_stopped: chain_unit(first.download_stopped, second.download_stopped),
        }
    }

    /// Invokes `spawn_part` inline.
    pub fn emit_spawn_part(&self, hash: &str, init_offset: i64, final_offset: i64) {
        if let Some(cb) = &self.spawn_part {
            cb(hash, init_offset, final_offset);
        }
    }

    /// Fans `download_progress` out on a supervised task.
    pub fn dispatch_download_progress(&self, wg: &WaitGroup, hash: &str, bytes: u64) {
        if let Some(cb) = &self.download_progress {
            let cb = Arc::clone(cb);
            let hash = hash.to_string();
            spawn_supervised("download-progress", Some(wg.clone()), None, async move {
                cb(&hash, bytes);
            });
        }
    }

    /// Invokes `download_complete` inline.
    pub fn emit_download_complete(&self, hash: &str, total_bytes: i64) {
        if let Some(cb) = &self.download_complete {
            cb(hash, total_bytes);
        }
    }

    /// Logs the error, then invokes the user handler when present.
    pub fn emit_error(&self, hash: &str, err: &DownloadError) {
        error!(hash, error = %err, "download failed");
        if let Some(cb) = &self.error {
            cb(hash, err);
        }
    }

    /// Invokes `compile_start` inline.
    pub fn emit_compile_start(&self, hash: &str) {
        if let Some(cb) = &self.compile_start {
            cb(hash);
        }
    }

    /// Fans `compile_progress` out on a supervised task.
    pub fn dispatch_compile_progress(&self, wg: &WaitGroup, hash: &str, bytes: u64) {
        if let Some(cb) = &self.compile_progress {
            let cb = Arc::clone(cb);
            let hash = hash.to_string();
            spawn_supervised("compile-progress", Some(wg.clone()), None, async move {
                cb(&hash, bytes);
            });
        }
    }

    /// Invokes `compile_skipped` inline.
    pub fn emit_compile_skipped(&self, hash: &str, total_bytes: i64) {
        if let Some(cb) = &self.compile_skipped {
            cb(hash, total_bytes);
        }
    }

    /// Invokes `compile_complete` inline.
    pub fn emit_compile_complete(&self, hash: &str, total_bytes: i64) {
        if let Some(cb) = &self.compile_complete {
            cb(hash, total_bytes);
        }
    }

    /// Invokes `download_stopped` inline.
    pub fn emit_download_stopped(&self) {
        if let Some(cb) = &self.download_stopped {
            cb();
        }
    }
}

fn chain3(first: Option<PartFn>, second: Option<PartFn>) -> Option<PartFn> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move |h, i, f| {
            a(h, i, f);
            b(h, i, f);
        })),
        (one, None) | (None, one) => one,
    }
}

fn chain4(first: Option<RespawnFn>, second: Option<RespawnFn>) -> Option<RespawnFn> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move |h, p, i, f| {
            a(h, p, i, f);
            b(h, p, i, f);
        })),
        (one, None) | (None, one) => one,
    }
}

fn chain_progress(first: Option<ProgressFn>, second: Option<ProgressFn>) -> Option<ProgressFn> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move |h, n| {
            a(h, n);
            b(h, n);
        })),
        (one, None) | (None, one) => one,
    }
}

fn chain_complete(first: Option<CompleteFn>, second: Option<CompleteFn>) -> Option<CompleteFn> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move |h, n| {
            a(h, n);
            b(h, n);
        })),
        (one, None) | (None, one) => one,
    }
}

fn chain_error(first: Option<ErrorFn>, second: Option<ErrorFn>) -> Option<ErrorFn> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move |h, e| {
            a(h, e);
            b(h, e);
        })),
        (one, None) | (None, one) => one,
    }
}

fn chain_hash(first: Option<HashFn>, second: Option<HashFn>) -> Option<HashFn> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move |h| {
            a(h);
            b(h);
        })),
        (one, None) | (None, one) => one,
    }
}

fn chain_unit(first: Option<UnitFn>, second: Option<UnitFn>) -> Option<UnitFn> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move || {
            a();
            b();
        })),
        (one, None) | (None, one) => one,
    }
}
