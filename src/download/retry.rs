//! Retry classification and exponential backoff for transient failures.
//!
//! When an operation fails, the error is classified into a
//! [`FailureType`]:
//! - [`FailureType::Transient`] - failures that may succeed on retry
//! - [`FailureType::Permanent`] - failures retrying cannot fix
//! - [`FailureType::Throttled`] - the remote is shedding load; retry with
//!   a doubled delay
//!
//! [`RetryConfig`] then decides whether to retry based on the failure
//! type and attempt count, computing exponential backoff with jitter.
//!
//! # Delay Calculation
//!
//! ```text
//! delay = min(max_delay, base_delay * backoff_factor^(attempt-1) * (1 + U(-1,1) * jitter_factor))
//! ```
//!
//! Throttled failures wait `min(2 * delay, max_delay)`.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DownloadError;

/// Default maximum retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Default jitter factor (±30 %).
const DEFAULT_JITTER_FACTOR: f64 = 0.3;

/// Message fragments indicating a failure worth retrying.
const TRANSIENT_FRAGMENTS: &[&str] = &[
    "connection reset",
    "connection refused",
    "broken pipe",
    "timeout",
    "eof",
    "temporary failure",
    "no such host",
    "network is unreachable",
];

/// Message fragments indicating the remote is shedding load.
const THROTTLED_FRAGMENTS: &[&str] = &[
    "429",
    "503",
    "too many requests",
    "service unavailable",
    "rate limit",
    "throttl",
];

/// Classification of a download failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,

    /// Failure that won't succeed regardless of retries.
    Permanent,

    /// The remote asked us to slow down; retry with a doubled delay.
    Throttled,
}

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts; `0` means unlimited.
    pub max_retries: u32,

    /// Base delay for the first retry. Zero disables waiting entirely.
    pub base_delay: Duration,

    /// Cap applied to every computed delay.
    pub max_delay: Duration,

    /// Jitter factor in `[0, 1]`; the delay is scaled by a uniform
    /// random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter_factor: f64,

    /// Multiplier applied per attempt; must be `>= 1`.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Computes the backoff delay for a 1-indexed attempt. Attempts below
    /// 1 are treated as 1. A zero base delay always yields zero so a
    /// misconfigured unlimited policy cannot turn into a retry storm.
    #[must_use]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let attempt = attempt.max(1);
        let factor = self.backoff_factor.max(1.0);
        let exponent = f64::from(attempt - 1);
        let base_ms = duration_to_ms(self.base_delay);
        let mut delay_ms = base_ms * factor.powf(exponent);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let scale = 1.0 + rand::thread_rng().gen_range(-1.0..=1.0) * jitter;
            delay_ms *= scale;
        }

        let capped = delay_ms.max(0.0).min(duration_to_ms(self.max_delay));
        ms_to_duration(capped)
    }

    /// Delay for a failure type: throttled failures double the computed
    /// backoff, still capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, failure: FailureType, attempt: u32) -> Duration {
        let delay = self.calculate_backoff(attempt);
        match failure {
            FailureType::Throttled => (delay * 2).min(self.max_delay),
            FailureType::Transient | FailureType::Permanent => delay,
        }
    }

    /// Whether another attempt should be made after `attempts` failures.
    /// Permanent failures never retry; `max_retries == 0` retries forever.
    #[must_use]
    pub fn should_retry(&self, failure: FailureType, attempts: u32) -> bool {
        if failure == FailureType::Permanent {
            return false;
        }
        self.max_retries == 0 || attempts < self.max_retries
    }
}

/// Mutable retry bookkeeping carried across attempts.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Failed attempts so far.
    pub attempts: u32,

    /// Display form of the most recent error.
    pub last_error: Option<String>,

    /// When the most recent attempt failed.
    pub last_attempt: Option<std::time::Instant>,

    /// Total time spent waiting between attempts.
    pub total_delayed: Duration,
}

impl RetryState {
    /// Records a failed attempt.
    pub fn record_failure(&mut self, error: &DownloadError) {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
        self.last_attempt = Some(std::time::Instant::now());
    }
}

/// Sleeps for the computed backoff, honoring cancellation. On a
/// successful wait the slept duration is added to
/// [`RetryState::total_delayed`].
///
/// # Errors
///
/// Returns [`DownloadError::Cancelled`] when the token fires mid-wait.
pub async fn wait_for_retry(
    config: &RetryConfig,
    state: &mut RetryState,
    failure: FailureType,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let delay = config.delay_for(failure, state.attempts);
    debug!(
        attempt = state.attempts,
        delay_ms = delay.as_millis(),
        throttled = failure == FailureType::Throttled,
        "waiting before retry"
    );
    tokio::select! {
        () = cancel.cancelled() => Err(DownloadError::Cancelled),
        () = tokio::time::sleep(delay) => {
            state.total_delayed += delay;
            Ok(())
        }
    }
}

/// Classifies a download error for retry decisions.
///
/// Cancellation is always permanent. HTTP 429/503 are throttled. Socket
/// error kinds and end-of-stream conditions are transient, as are errors
/// whose message mentions a known transient condition; messages naming a
/// load-shedding condition are throttled. Everything else is permanent.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::Cancelled => return FailureType::Permanent,
        DownloadError::HttpStatus { status, .. } if matches!(*status, 429 | 503) => {
            return FailureType::Throttled;
        }
        DownloadError::HttpStatus { status, .. } => {
            return if *status == 408 || (500..600).contains(status) {
                FailureType::Transient
            } else {
                FailureType::Permanent
            };
        }
        DownloadError::Network { source, .. } => {
            // A transport-reported timeout is retryable even when the
            // request deadline elapsed.
            if source.is_timeout() || source.is_connect() {
                return FailureType::Transient;
            }
        }
        DownloadError::Io { source, .. } => {
            if super::error::io_kind_is_transient(source) {
                return FailureType::Transient;
            }
        }
        _ => {}
    }

    let message = error_chain_message(error);
    if TRANSIENT_FRAGMENTS.iter().any(|f| message.contains(f)) {
        return FailureType::Transient;
    }
    if THROTTLED_FRAGMENTS.iter().any(|f| message.contains(f)) {
        return FailureType::Throttled;
    }
    if error.is_transient() {
        return FailureType::Transient;
    }
    FailureType::Permanent
}

/// Lowercased display of the error and its source chain.
fn error_chain_message(error: &DownloadError) -> String {
    use std::error::Error as _;

    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message.to_lowercase()
}

#[allow(clippy::cast_precision_loss)]
fn duration_to_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ms_to_duration(ms: f64) -> Duration {
    Duration::from_secs_f64((ms / 1000.0).max(0.0))
}
