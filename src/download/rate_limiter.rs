//! Shared token-bucket rate limiting for download streams.
//!
//! One [`SpeedLimiter`] is shared by every stream of a download (and may
//! be shared across downloads). The limit is read atomically on every
//! acquisition, so [`SpeedLimiter::set_limit`] is safe under concurrent
//! reads and takes effect on the following call. A limit of zero or
//! below means unlimited.
//!
//! Two consumption styles are supported:
//! - `acquire(n)` for chunk loops (HTTP/FTP adapters)
//! - [`RateLimited`], an `AsyncRead` decorator that acquires tokens for
//!   the read size before forwarding to the inner reader (SFTP adapter);
//!   it also forwards `AsyncWrite`, so shutdown reaches the inner stream

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tracing::debug;

/// Shared token bucket with an atomically updatable limit.
///
/// Bucket capacity equals the limit, so at most one second of burst is
/// admitted. Acquisitions larger than the capacity are admitted once the
/// bucket is full and paid off as debt, delaying subsequent callers.
#[derive(Debug, Clone)]
pub struct SpeedLimiter {
    inner: Arc<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; `<= 0` means unlimited.
    limit: AtomicI64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// Creates a limiter capped at `limit` bytes per second; zero or
    /// negative means unlimited.
    #[must_use]
    pub fn new(limit: i64) -> Self {
        Self {
            inner: Arc::new(Bucket {
                limit: AtomicI64::new(limit),
                state: Mutex::new(BucketState {
                    tokens: limit.max(0) as f64,
                    last_refill: Instant::now(),
                }),
            }),
        }
    }

    /// Creates an unlimited limiter.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// The current limit in bytes per second.
    #[must_use]
    pub fn limit(&self) -> i64 {
        self.inner.limit.load(Ordering::Acquire)
    }

    /// Updates the limit; takes effect on the following acquisition.
    pub fn set_limit(&self, limit: i64) {
        debug!(limit, "updating speed limit");
        self.inner.limit.store(limit, Ordering::Release);
    }

    /// Acquires `n` tokens, sleeping as needed. Unlimited limiters
    /// return immediately.
    pub async fn acquire(&self, n: usize) {
        loop {
            let limit = self.limit();
            if limit <= 0 {
                return;
            }
            let wait = {
                let mut state = lock_state(&self.inner.state);
                let capacity = limit as f64;
                refill(&mut state, capacity, limit);
                let threshold = (n as f64).min(capacity);
                if state.tokens >= threshold {
                    // Oversized acquisitions go into debt, delaying the
                    // next caller instead of stalling forever.
                    state.tokens -= n as f64;
                    return;
                }
                Duration::from_secs_f64((threshold - state.tokens) / capacity)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Attempts a synchronous acquisition of up to `want` tokens.
    /// Returns the granted amount, or the duration to wait before enough
    /// tokens accumulate.
    fn try_acquire(&self, want: usize) -> Result<usize, Duration> {
        let limit = self.limit();
        if limit <= 0 {
            return Ok(want);
        }
        let mut state = lock_state(&self.inner.state);
        let capacity = limit as f64;
        refill(&mut state, capacity, limit);
        if state.tokens >= 1.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let granted = (state.tokens as usize).min(want).max(1);
            state.tokens -= granted as f64;
            Ok(granted)
        } else {
            let threshold = (want as f64).min(capacity).max(1.0);
            Err(Duration::from_secs_f64(
                (threshold - state.tokens) / capacity,
            ))
        }
    }

    /// Returns unused tokens to the bucket.
    fn refund(&self, n: usize) {
        let limit = self.limit();
        if limit <= 0 || n == 0 {
            return;
        }
        let mut state = lock_state(&self.inner.state);
        state.tokens = (state.tokens + n as f64).min(limit as f64);
    }
}

fn lock_state(state: &Mutex<BucketState>) -> std::sync::MutexGuard<'_, BucketState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn refill(state: &mut BucketState, capacity: f64, limit: i64) {
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(state.last_refill);
    state.last_refill = now;
    state.tokens = (state.tokens + elapsed.as_secs_f64() * limit as f64).min(capacity);
}

/// `AsyncRead` decorator acquiring tokens for each read before
/// forwarding to the inner reader. Writes and shutdown pass through
/// unthrottled so the stream can still be closed.
#[derive(Debug)]
pub struct RateLimited<R> {
    inner: R,
    limiter: SpeedLimiter,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<R> RateLimited<R> {
    /// Wraps a reader with the given limiter.
    pub fn new(inner: R, limiter: SpeedLimiter) -> Self {
        Self {
            inner,
            limiter,
            sleep: None,
        }
    }

    /// Unwraps the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RateLimited<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.limiter.limit() <= 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        if let Some(sleep) = this.sleep.as_mut() {
            match sleep.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.sleep = None,
            }
        }
        let want = buf.remaining();
        if want == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        match this.limiter.try_acquire(want) {
            Ok(granted) => {
                let mut limited = buf.take(granted);
                match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
                    Poll::Ready(Ok(())) => {
                        let n = limited.filled().len();
                        if n < granted {
                            this.limiter.refund(granted - n);
                        }
                        // SAFETY: the inner reader initialized `n` bytes of
                        // the limited view, which aliases `buf`'s unfilled
                        // region (same pattern as tokio's `io::util::take`).
                        unsafe { buf.assume_init(n) };
                        buf.advance(n);
                        Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Err(e)) => {
                        this.limiter.refund(granted);
                        Poll::Ready(Err(e))
                    }
                    Poll::Pending => {
                        this.limiter.refund(granted);
                        Poll::Pending
                    }
                }
            }
            Err(wait) => {
                let mut sleep = Box::pin(tokio::time::sleep(wait));
                if sleep.as_mut().poll(cx).is_ready() {
                    cx.waker().wake_by_ref();
                }
                this.sleep = Some(sleep);
                Poll::Pending
            }
        }
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for RateLimited<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Errors parsing a human-readable rate limit.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitParseError {
    /// The input was empty or whitespace.
    #[error("empty rate limit")]
    Empty,

    /// No numeric value preceded the unit.
    #[error("missing numeric value in rate limit {input:?}")]
    MissingValue {
        /// The offending input.
        input: String,
    },

    /// The numeric value did not parse.
    #[error("invalid numeric value in rate limit {input:?}")]
    InvalidValue {
        /// The offending input.
        input: String,
    },

    /// The unit suffix is not one of B, KB, MB, GB.
    #[error("unrecognized unit {unit:?} in rate limit {input:?}")]
    UnknownUnit {
        /// The unparsed suffix.
        unit: String,
        /// The offending input.
        input: String,
    },
}

/// Parses a rate limit such as `500KB`, `1.5mb`, or `2097152`, returning
/// bytes per second. Units are binary multiples and case-insensitive.
///
/// # Errors
///
/// Fails on empty, unit-only, negative, unrecognized-unit, or
/// multi-unit inputs.
pub fn parse_rate_limit(input: &str) -> Result<i64, RateLimitParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(RateLimitParseError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(RateLimitParseError::MissingValue {
            input: input.to_string(),
        });
    }
    let value: f64 = number
        .parse()
        .map_err(|_| RateLimitParseError::InvalidValue {
            input: input.to_string(),
        })?;

    let multiplier: f64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(RateLimitParseError::UnknownUnit {
                unit: other.to_string(),
                input: input.to_string(),
            });
        }
    };

    let bytes = value * multiplier;
    #[allow(clippy::cast_precision_loss)]
    if !bytes.is_finite() || bytes > i64::MAX as f64 {
        return Err(RateLimitParseError::InvalidValue {
            input: input.to_string(),
        });
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(bytes as i64)
}
