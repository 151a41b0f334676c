//! Segmented HTTP downloader.
//!
//! The parallel path of the engine: a probe learns the file name, total
//! size, and resumability; planning divides `[0, total)` into contiguous
//! ranges; one supervised worker per part streams its range into a
//! dedicated `<hash>.warp` staging file; compilation splices the staged
//! parts into the destination in offset order. When the server rejects
//! ranged requests the engine falls back to a single unranged stream
//! with no parallelism and no resume.
//!
//! # Concurrency
//!
//! Workers are spawned all at once and gated by a semaphore sized to the
//! connection cap. Progress callbacks are fanned out on supervised tasks
//! so user code can never stall the data path. A fatal error in any part
//! cancels its siblings through a job-local token; an external stop is
//! honored at every chunk boundary and surfaces as a graceful `Ok`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{
    CHUNK_SIZE, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PARTS, MAIN_HASH, MAX_RETRY_AFTER,
    PART_FILE_EXT, min_part_size_for,
};
use super::error::DownloadError;
use super::handlers::EventHandlers;
use super::protocol::{
    Capabilities, Checksum, ContentLength, DownloaderOptions, ProbeResult, Protocol,
    ProtocolDownloader, StopHandle,
};
use super::rate_limiter::SpeedLimiter;
use super::retry::{FailureType, RetryConfig, RetryState, classify_error, wait_for_retry};
use super::spawner::{WaitGroup, spawn_supervised};
use crate::config::Environment;
use crate::headers::Headers;
use crate::manager::item::{ItemPart, derive_item_hash, new_part_hash};

/// One planned byte range and its staging state.
#[derive(Debug, Clone)]
struct PartJob {
    hash: String,
    init_offset: i64,
    /// Inclusive end byte; `-1` for an unranged whole-file stream.
    final_offset: i64,
    compiled: bool,
    /// Whether the worker sends a `Range` header.
    ranged: bool,
}

/// Everything a part worker needs, detached from `&self`.
#[derive(Clone)]
struct PartContext {
    client: reqwest::Client,
    url: String,
    headers: Headers,
    retry: RetryConfig,
    limiter: SpeedLimiter,
    handlers: EventHandlers,
    cb_wg: WaitGroup,
    abort: CancellationToken,
    part_path: PathBuf,
    part_hash: String,
    init_offset: i64,
    final_offset: i64,
    ranged: bool,
}

/// How a batch of part workers ended.
enum RunOutcome {
    Finished,
    Stopped,
}

/// Segmented HTTP/HTTPS downloader.
pub struct HttpDownloader {
    client: reqwest::Client,
    url: String,
    hash: String,
    file_name: String,
    download_dir: PathBuf,
    save_dir: PathBuf,
    headers: Headers,
    max_connections: usize,
    max_parts: usize,
    min_part_size: Option<i64>,
    retry: RetryConfig,
    limiter: SpeedLimiter,
    content_length: ContentLength,
    resumable: bool,
    probed: bool,
    stop: StopHandle,
}

impl HttpDownloader {
    /// Creates a downloader for an HTTP(S) URL. No network traffic
    /// happens until [`ProtocolDownloader::probe`].
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] for unparseable URLs and
    /// [`DownloadError::UnsupportedScheme`] for non-HTTP schemes.
    pub fn new(
        client: reqwest::Client,
        env: &Environment,
        url: &str,
        limiter: SpeedLimiter,
        opts: DownloaderOptions,
    ) -> Result<Self, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let scheme = parsed.scheme().to_ascii_lowercase();
        if !matches!(scheme.as_str(), "http" | "https") {
            return Err(DownloadError::UnsupportedScheme { scheme });
        }

        let hash = opts
            .hash
            .clone()
            .unwrap_or_else(|| derive_item_hash(url));
        let file_name = opts
            .file_name
            .clone()
            .or_else(|| filename_from_url(&parsed))
            .unwrap_or_else(|| format!("download_{hash}"));
        let save_dir = opts
            .save_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            client,
            url: url.to_string(),
            download_dir: env.item_dir(&hash),
            hash,
            file_name,
            save_dir,
            headers: opts.headers,
            max_connections: opts.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            max_parts: opts.max_parts.unwrap_or(DEFAULT_MAX_PARTS),
            min_part_size: opts.min_part_size,
            retry: opts.retry,
            limiter,
            content_length: ContentLength::UNKNOWN,
            resumable: false,
            probed: false,
            stop: StopHandle::new(),
        })
    }

    /// The source URL as supplied (credentials included, when any).
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn part_path(&self, part_hash: &str) -> PathBuf {
        self.download_dir.join(format!("{part_hash}.{PART_FILE_EXT}"))
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in self.headers.iter() {
            request = request.header(key, value);
        }
        request
    }

    /// Divides `[0, total)` into contiguous ranges. The part size is
    /// `max(ceil(total / max_parts), min_part_size)` and the last range
    /// absorbs any remainder.
    fn plan_ranges(&self) -> Vec<(i64, i64)> {
        let total = self.content_length.as_i64();
        if total <= 0 {
            return Vec::new();
        }
        let min_part = self.min_part_size.unwrap_or_else(|| min_part_size_for(total));
        let max_parts = i64::try_from(self.max_parts.max(1)).unwrap_or(1);
        let part_size = ((total + max_parts - 1) / max_parts).max(min_part.max(1));
        let count = (total / part_size).max(1);

        let mut ranges = Vec::with_capacity(usize::try_from(count).unwrap_or(1));
        for i in 0..count {
            let start = i * part_size;
            let end = if i == count - 1 {
                total - 1
            } else {
                (i + 1) * part_size - 1
            };
            ranges.push((start, end));
        }
        ranges
    }

    fn fresh_jobs(&self) -> Vec<PartJob> {
        if self.resumable && self.content_length.is_known() {
            self.plan_ranges()
                .into_iter()
                .map(|(init, fin)| PartJob {
                    hash: new_part_hash(),
                    init_offset: init,
                    final_offset: fin,
                    compiled: false,
                    ranged: true,
                })
                .collect()
        } else {
            vec![self.single_stream_job()]
        }
    }

    fn single_stream_job(&self) -> PartJob {
        let final_offset = if self.content_length.is_known() {
            self.content_length.as_i64() - 1
        } else {
            -1
        };
        PartJob {
            hash: new_part_hash(),
            init_offset: 0,
            final_offset,
            compiled: false,
            ranged: false,
        }
    }

    async fn prepare_dirs(&self) -> Result<(), DownloadError> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| DownloadError::io(self.download_dir.clone(), e))?;
        tokio::fs::create_dir_all(&self.save_dir)
            .await
            .map_err(|e| DownloadError::io(self.save_dir.clone(), e))?;
        Ok(())
    }

    /// Spawns one supervised worker per non-compiled part and waits for
    /// the batch, including the progress-callback fan-out.
    async fn run_parts(
        &self,
        jobs: &[PartJob],
        handlers: &EventHandlers,
    ) -> Result<RunOutcome, DownloadError> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections.max(1)));
        let wg = WaitGroup::new();
        let cb_wg = WaitGroup::new();
        let abort = self.stop.token().child_token();
        let first_error: Arc<Mutex<Option<DownloadError>>> = Arc::default();

        for job in jobs.iter().filter(|j| !j.compiled) {
            handlers.emit_spawn_part(&job.hash, job.init_offset, job.final_offset);

            let ctx = PartContext {
                client: self.client.clone(),
                url: self.url.clone(),
                headers: self.headers.clone(),
                retry: self.retry.clone(),
                limiter: self.limiter.clone(),
                handlers: handlers.clone(),
                cb_wg: cb_wg.clone(),
                abort: abort.clone(),
                part_path: self.part_path(&job.hash),
                part_hash: job.hash.clone(),
                init_offset: job.init_offset,
                final_offset: job.final_offset,
                ranged: job.ranged,
            };
            let semaphore = Arc::clone(&semaphore);
            let abort = abort.clone();
            let first_error = Arc::clone(&first_error);

            spawn_supervised(
                format!("part:{}", job.hash),
                Some(wg.clone()),
                None,
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    if abort.is_cancelled() {
                        return;
                    }
                    if let Err(e) = download_part(ctx).await {
                        let mut slot =
                            first_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        drop(slot);
                        abort.cancel();
                    }
                },
            );
        }

        wg.wait().await;
        cb_wg.wait().await;

        let error = first_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(e) = error {
            return Err(e);
        }
        if self.stop.is_stopped() {
            return Ok(RunOutcome::Stopped);
        }
        Ok(RunOutcome::Finished)
    }

    /// Splices staged parts into the destination in ascending
    /// initial-offset order, removing each staging file once copied.
    /// Returns the number of bytes written by this pass.
    async fn compile(
        &self,
        jobs: &[PartJob],
        handlers: &EventHandlers,
    ) -> Result<i64, DownloadError> {
        let dest_path = self.save_path();
        handlers.emit_compile_start(MAIN_HASH);

        let mut dest = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&dest_path)
            .await
            .map_err(|e| DownloadError::io(dest_path.clone(), e))?;

        let mut sorted: Vec<&PartJob> = jobs.iter().collect();
        sorted.sort_by_key(|j| j.init_offset);

        let cb_wg = WaitGroup::new();
        let mut total_written: i64 = 0;

        for job in sorted {
            if job.compiled {
                let size = (job.final_offset - job.init_offset + 1).max(0);
                handlers.emit_compile_skipped(&job.hash, size);
                continue;
            }

            let part_path = self.part_path(&job.hash);
            let mut src = File::open(&part_path)
                .await
                .map_err(|e| DownloadError::io(part_path.clone(), e))?;
            #[allow(clippy::cast_sign_loss)]
            dest.seek(std::io::SeekFrom::Start(job.init_offset.max(0) as u64))
                .await
                .map_err(|e| DownloadError::io(dest_path.clone(), e))?;

            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut copied: i64 = 0;
            loop {
                let n = src
                    .read(&mut buf)
                    .await
                    .map_err(|e| DownloadError::io(part_path.clone(), e))?;
                if n == 0 {
                    break;
                }
                dest.write_all(&buf[..n])
                    .await
                    .map_err(|e| DownloadError::io(dest_path.clone(), e))?;
                handlers.dispatch_compile_progress(&cb_wg, &job.hash, n as u64);
                copied += i64::try_from(n).unwrap_or(0);
            }
            drop(src);

            tokio::fs::remove_file(&part_path)
                .await
                .map_err(|e| DownloadError::io(part_path.clone(), e))?;
            handlers.emit_compile_complete(&job.hash, copied);
            total_written += copied;
        }

        dest.flush()
            .await
            .map_err(|e| DownloadError::io(dest_path.clone(), e))?;
        dest.sync_all()
            .await
            .map_err(|e| DownloadError::io(dest_path.clone(), e))?;
        cb_wg.wait().await;

        // Best effort: drop the now-empty segment workspace.
        let _ = tokio::fs::remove_dir(&self.download_dir).await;

        Ok(total_written)
    }

    async fn run_and_compile(
        &mut self,
        mut jobs: Vec<PartJob>,
        handlers: &EventHandlers,
    ) -> Result<(), DownloadError> {
        match self.run_parts(&jobs, handlers).await {
            Ok(RunOutcome::Stopped) => {
                handlers.emit_download_stopped();
                return Ok(());
            }
            Ok(RunOutcome::Finished) => {}
            Err(DownloadError::RangeNotSupported { .. }) if jobs.iter().any(|j| j.ranged) => {
                warn!(url = %self.url, "server rejected ranged request; falling back to a single stream");
                self.resumable = false;
                for job in &jobs {
                    let _ = tokio::fs::remove_file(self.part_path(&job.hash)).await;
                }
                jobs = vec![self.single_stream_job()];
                match self.run_parts(&jobs, handlers).await? {
                    RunOutcome::Stopped => {
                        handlers.emit_download_stopped();
                        return Ok(());
                    }
                    RunOutcome::Finished => {}
                }
            }
            Err(e) => {
                handlers.emit_error(MAIN_HASH, &e);
                return Err(e);
            }
        }

        let written = self.compile(&jobs, handlers).await?;
        let total = if self.content_length.is_known() {
            self.content_length.as_i64()
        } else {
            written
        };
        handlers.emit_download_complete(MAIN_HASH, total);
        info!(hash = %self.hash, total, "download complete");
        Ok(())
    }
}

#[async_trait]
impl ProtocolDownloader for HttpDownloader {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn probe(&mut self) -> Result<ProbeResult, DownloadError> {
        let request = self
            .apply_headers(self.client.get(&self.url))
            .header(RANGE, "bytes=0-0");
        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(&self.url, "probe", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&self.url, &response));
        }

        let (content_length, resumable) = if status.as_u16() == 206 {
            (parse_content_range_total(&response), true)
        } else {
            let length = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .map_or(ContentLength::UNKNOWN, ContentLength::known);
            // Some servers answer 200 for a 1-byte range yet still
            // advertise range support.
            let advertises_ranges = response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
            (length, advertises_ranges)
        };

        if let Some(name) = filename_from_disposition(&response) {
            if self.file_name.starts_with("download_") || self.file_name.is_empty() {
                self.file_name = name;
            }
        }

        let checksums = response
            .headers()
            .get("content-md5")
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                vec![Checksum {
                    algorithm: "md5".to_string(),
                    value: v.to_string(),
                }]
            })
            .unwrap_or_default();

        self.content_length = content_length;
        self.resumable = resumable && content_length.is_known();
        self.probed = true;

        debug!(
            size = %self.content_length,
            resumable = self.resumable,
            file_name = %self.file_name,
            "probe complete"
        );

        Ok(ProbeResult {
            file_name: self.file_name.clone(),
            content_length: self.content_length,
            resumable: self.resumable,
            checksums,
        })
    }

    #[instrument(skip(self, handlers), fields(hash = %self.hash))]
    async fn download(&mut self, handlers: EventHandlers) -> Result<(), DownloadError> {
        if !self.probed {
            return Err(DownloadError::ProbeRequired {
                protocol: Protocol::Http,
            });
        }
        if self.stop.is_stopped() {
            return Ok(());
        }
        self.prepare_dirs().await?;

        let jobs = self.fresh_jobs();
        info!(
            hash = %self.hash,
            parts = jobs.len(),
            size = %self.content_length,
            "starting segmented download"
        );
        self.run_and_compile(jobs, &handlers).await
    }

    #[instrument(skip(self, parts, handlers), fields(hash = %self.hash))]
    async fn resume(
        &mut self,
        parts: BTreeMap<i64, ItemPart>,
        handlers: EventHandlers,
    ) -> Result<(), DownloadError> {
        if !self.probed {
            return Err(DownloadError::ProbeRequired {
                protocol: Protocol::Http,
            });
        }
        if self.stop.is_stopped() {
            return Ok(());
        }
        if parts.is_empty() {
            return self.download(handlers).await;
        }

        let dest_exists = tokio::fs::try_exists(self.save_path())
            .await
            .unwrap_or(false);
        if parts.values().any(|p| p.compiled) && !dest_exists {
            return Err(DownloadError::DestinationMissing {
                path: self.save_path(),
            });
        }
        if parts.values().all(|p| p.compiled) {
            debug!(hash = %self.hash, "every part already compiled; nothing to resume");
            return Ok(());
        }

        self.prepare_dirs().await?;
        let jobs: Vec<PartJob> = parts
            .iter()
            .map(|(init, part)| PartJob {
                hash: part.hash.clone(),
                init_offset: *init,
                final_offset: part.final_offset,
                compiled: part.compiled,
                // A part persisted from an unknown-size run has no end
                // offset and must restart as a plain stream.
                ranged: part.final_offset >= 0,
            })
            .collect();

        info!(
            hash = %self.hash,
            parts = jobs.len(),
            pending = jobs.iter().filter(|j| !j.compiled).count(),
            "resuming segmented download"
        );
        self.run_and_compile(jobs, &handlers).await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_parallel: true,
            supports_resume: true,
        }
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    async fn close(&mut self) {
        self.stop.stop();
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn download_directory(&self) -> PathBuf {
        self.download_dir.clone()
    }

    fn save_path(&self) -> PathBuf {
        self.save_dir.join(&self.file_name)
    }

    fn content_length(&self) -> ContentLength {
        self.content_length
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn max_parts(&self) -> usize {
        self.max_parts
    }
}

/// Retry loop of one part worker. Cancellation is graceful: a stopped or
/// aborted part returns `Ok` and leaves its staging file for resume.
async fn download_part(ctx: PartContext) -> Result<(), DownloadError> {
    let mut state = RetryState::default();
    loop {
        if ctx.abort.is_cancelled() {
            return Ok(());
        }

        let existing = tokio::fs::metadata(&ctx.part_path)
            .await
            .map(|m| i64::try_from(m.len()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        if ctx.final_offset >= 0 && ctx.init_offset + existing > ctx.final_offset {
            // The staged bytes already cover the range.
            return Ok(());
        }

        match fetch_part(&ctx, existing).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if ctx.abort.is_cancelled() {
                    // In-flight reads are cut when the transport cancels;
                    // the resulting error is not a real failure.
                    return Ok(());
                }
                let failure = classify_error(&e);
                state.record_failure(&e);
                debug!(
                    part = %ctx.part_hash,
                    attempt = state.attempts,
                    error = %e,
                    ?failure,
                    "part attempt failed"
                );
                if failure == FailureType::Permanent
                    || !ctx.retry.should_retry(failure, state.attempts)
                {
                    return Err(e);
                }

                // A server-mandated Retry-After overrides the computed
                // backoff, still capped.
                if let Some(delay) = e.retry_after().and_then(parse_retry_after) {
                    let delay = delay.min(MAX_RETRY_AFTER);
                    debug!(part = %ctx.part_hash, delay_ms = delay.as_millis(), "honoring Retry-After");
                    tokio::select! {
                        () = ctx.abort.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => state.total_delayed += delay,
                    }
                } else if wait_for_retry(&ctx.retry, &mut state, failure, &ctx.abort)
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
    }
}

/// One request attempt: issues the (possibly ranged) GET and streams the
/// body into the staging file, emitting progress per chunk.
async fn fetch_part(ctx: &PartContext, existing: i64) -> Result<(), DownloadError> {
    let mut request = ctx.client.get(&ctx.url);
    for (key, value) in ctx.headers.iter() {
        request = request.header(key, value);
    }
    if ctx.ranged {
        request = request.header(
            RANGE,
            format!("bytes={}-{}", ctx.init_offset + existing, ctx.final_offset),
        );
    }

    let response = request
        .send()
        .await
        .map_err(|e| map_send_error(&ctx.url, "part", e))?;
    let status = response.status();
    if ctx.ranged && status.as_u16() == 200 {
        return Err(DownloadError::RangeNotSupported {
            url: ctx.url.clone(),
        });
    }
    if !status.is_success() {
        return Err(status_error(&ctx.url, &response));
    }

    // Unranged retries cannot reuse stale bytes.
    let mut file = if ctx.ranged {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ctx.part_path)
            .await
    } else {
        File::create(&ctx.part_path).await
    }
    .map_err(|e| DownloadError::io(ctx.part_path.clone(), e))?;

    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            () = ctx.abort.cancelled() => break,
            next = stream.next() => match next {
                None => break,
                Some(result) => result.map_err(|e| DownloadError::network(&ctx.url, "read", e))?,
            },
        };
        ctx.limiter.acquire(chunk.len()).await;
        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(ctx.part_path.clone(), e))?;
        ctx.handlers
            .dispatch_download_progress(&ctx.cb_wg, &ctx.part_hash, chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|e| DownloadError::io(ctx.part_path.clone(), e))?;
    Ok(())
}

fn map_send_error(url: &str, op: &'static str, error: reqwest::Error) -> DownloadError {
    DownloadError::network(url, op, error)
}

fn status_error(url: &str, response: &reqwest::Response) -> DownloadError {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string);
    DownloadError::http_status(url, response.status().as_u16(), retry_after)
}

/// Total size from a 206 `Content-Range: bytes 0-0/N` header; `*` and
/// malformed values are unknown.
fn parse_content_range_total(response: &reqwest::Response) -> ContentLength {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.trim().parse::<i64>().ok())
        .map_or(ContentLength::UNKNOWN, ContentLength::known)
}

/// File name from a `Content-Disposition` header; handles quoted and
/// RFC 5987 `filename*` forms.
fn filename_from_disposition(response: &reqwest::Response) -> Option<String> {
    let value = response.headers().get(CONTENT_DISPOSITION)?.to_str().ok()?;
    for segment in value.split(';') {
        let segment = segment.trim();
        if let Some(encoded) = segment.strip_prefix("filename*=") {
            let encoded = encoded.trim_start_matches("UTF-8''").trim_start_matches("utf-8''");
            if let Ok(decoded) = urlencoding::decode(encoded) {
                let name = decoded.trim_matches('"').trim();
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
        if let Some(name) = segment.strip_prefix("filename=") {
            let name = name.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Last non-empty, URL-decoded path segment.
fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let decoded = urlencoding::decode(segment).unwrap_or_else(|_| segment.into());
    let name = decoded.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Parses a Retry-After value: integer seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        return Some(Duration::from_secs(seconds as u64).min(MAX_RETRY_AFTER));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    match when.duration_since(std::time::SystemTime::now()) {
        Ok(delay) => Some(delay.min(MAX_RETRY_AFTER)),
        Err(_) => Some(Duration::ZERO),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::constants::{MIN_PART_SIZE_MEDIUM, MIN_PART_SIZE_SMALL, SIZE_100_MIB};
    use tempfile::TempDir;

    fn test_downloader(url: &str, opts: DownloaderOptions) -> (TempDir, HttpDownloader) {
        let tmp = TempDir::new().unwrap();
        let env = Environment::with_config_dir(tmp.path().join("cfg")).unwrap();
        let opts = DownloaderOptions {
            save_dir: Some(tmp.path().join("out")),
            ..opts
        };
        let dl = HttpDownloader::new(
            reqwest::Client::new(),
            &env,
            url,
            SpeedLimiter::unlimited(),
            opts,
        )
        .unwrap();
        (tmp, dl)
    }

    // ==================== Construction Tests ====================

    #[test]
    fn test_new_rejects_invalid_url() {
        let tmp = TempDir::new().unwrap();
        let env = Environment::with_config_dir(tmp.path()).unwrap();
        let result = HttpDownloader::new(
            reqwest::Client::new(),
            &env,
            "not a url",
            SpeedLimiter::unlimited(),
            DownloaderOptions::default(),
        );
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[test]
    fn test_new_rejects_non_http_scheme() {
        let tmp = TempDir::new().unwrap();
        let env = Environment::with_config_dir(tmp.path()).unwrap();
        let result = HttpDownloader::new(
            reqwest::Client::new(),
            &env,
            "ftp://example.com/f.bin",
            SpeedLimiter::unlimited(),
            DownloaderOptions::default(),
        );
        assert!(matches!(
            result,
            Err(DownloadError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_file_name_from_url_path() {
        let (_tmp, dl) = test_downloader(
            "https://example.com/files/archive.tar.gz?token=1",
            DownloaderOptions::default(),
        );
        assert_eq!(dl.file_name(), "archive.tar.gz");
    }

    #[test]
    fn test_download_before_probe_fails() {
        let (_tmp, mut dl) =
            test_downloader("https://example.com/f.bin", DownloaderOptions::default());
        let result = tokio_test::block_on(dl.download(EventHandlers::default()));
        assert!(matches!(result, Err(DownloadError::ProbeRequired { .. })));
    }

    // ==================== Planning Tests ====================

    fn planning_downloader(
        total: i64,
        max_parts: usize,
        min_part: Option<i64>,
    ) -> (TempDir, HttpDownloader) {
        let (tmp, mut dl) = test_downloader(
            "https://example.com/f.bin",
            DownloaderOptions {
                max_parts: Some(max_parts),
                min_part_size: min_part,
                ..DownloaderOptions::default()
            },
        );
        dl.content_length = ContentLength::known(total);
        dl.resumable = true;
        (tmp, dl)
    }

    #[test]
    fn test_plan_four_even_parts() {
        let (_tmp, dl) = planning_downloader(1_048_576, 4, Some(256 * 1024));
        let ranges = dl.plan_ranges();
        assert_eq!(
            ranges,
            vec![
                (0, 262_143),
                (262_144, 524_287),
                (524_288, 786_431),
                (786_432, 1_048_575),
            ]
        );
    }

    #[test]
    fn test_plan_respects_min_part_size_table() {
        // 1 MiB file with the default table: minimum 512 KiB, so at most
        // two parts regardless of the requested count.
        let (_tmp, dl) = planning_downloader(1_048_576, 16, None);
        let ranges = dl.plan_ranges();
        assert_eq!(
            ranges,
            vec![(0, MIN_PART_SIZE_SMALL - 1), (MIN_PART_SIZE_SMALL, 1_048_575)]
        );
    }

    #[test]
    fn test_plan_last_range_absorbs_remainder() {
        let (_tmp, dl) = planning_downloader(10, 3, Some(4));
        // part size = max(ceil(10/3), 4) = 4; 10/4 = 2 parts, last absorbs
        assert_eq!(dl.plan_ranges(), vec![(0, 3), (4, 9)]);
    }

    #[test]
    fn test_plan_large_file_uses_medium_tier() {
        let total = SIZE_100_MIB + 512;
        let (_tmp, dl) = planning_downloader(total, 1024, None);
        let ranges = dl.plan_ranges();
        assert!(ranges.len() <= usize::try_from(total / MIN_PART_SIZE_MEDIUM).unwrap() + 1);
        // Contiguity and coverage
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, total - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn test_plan_unknown_size_yields_no_ranges() {
        let (_tmp, mut dl) = planning_downloader(0, 4, None);
        dl.content_length = ContentLength::UNKNOWN;
        assert!(dl.plan_ranges().is_empty());
        let jobs = dl.fresh_jobs();
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].ranged);
        assert_eq!(jobs[0].final_offset, -1);
    }

    #[test]
    fn test_single_part_when_not_resumable() {
        let (_tmp, mut dl) = planning_downloader(1_048_576, 4, None);
        dl.resumable = false;
        let jobs = dl.fresh_jobs();
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].ranged);
        assert_eq!(jobs[0].final_offset, 1_048_575);
    }

    // ==================== Retry-After Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_retry_after_negative_and_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_past_http_date_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 01 Jan 2020 00:00:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}
