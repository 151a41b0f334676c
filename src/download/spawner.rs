//! Supervised task spawning with panic recovery.
//!
//! Every background task the engine starts goes through
//! [`spawn_supervised`]: the attached [`WaitGroup`] counter is released
//! on all exit paths, panics are caught and logged with a captured
//! backtrace, and an optional hook observes the panic payload. A panic
//! inside a spawned closure never crosses the task boundary.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;

use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;

/// Hook invoked with the recovered panic payload.
pub type PanicHook = Arc<dyn Fn(&(dyn Any + Send)) + Send + Sync>;

/// Counter tracking in-flight supervised tasks.
///
/// `add` before spawning, `done` on completion (handled by the spawner's
/// drop guard), `wait` until the count returns to zero.
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Debug, Default)]
struct WaitGroupInner {
    count: Mutex<usize>,
    notify: Notify,
}

impl WaitGroup {
    /// Creates an empty wait group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to the counter.
    pub fn add(&self, n: usize) {
        let mut count = lock_count(&self.inner.count);
        *count += n;
    }

    /// Releases one unit of the counter, waking waiters at zero.
    pub fn done(&self) {
        let mut count = lock_count(&self.inner.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Current counter value.
    #[must_use]
    pub fn count(&self) -> usize {
        *lock_count(&self.inner.count)
    }

    /// Waits until the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn lock_count(count: &Mutex<usize>) -> std::sync::MutexGuard<'_, usize> {
    count.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Releases the wait group on drop, so the counter is decremented on
/// normal completion, error, and panic alike.
struct WaitGroupGuard(WaitGroup);

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Runs a future on a new task under supervision.
///
/// The counter (when given) is incremented before spawning and released
/// on every exit path. A panic is recovered, logged as
/// `PANIC [label]: <payload>` with the captured backtrace, and forwarded
/// to `on_panic` when present.
pub fn spawn_supervised<F>(
    label: impl Into<String>,
    counter: Option<WaitGroup>,
    on_panic: Option<PanicHook>,
    future: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let label = label.into();
    if let Some(wg) = &counter {
        wg.add(1);
    }
    tokio::spawn(async move {
        let _guard = counter.map(WaitGroupGuard);
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(()) => {}
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    task = %label,
                    backtrace = %Backtrace::force_capture(),
                    "PANIC [{label}]: {message}"
                );
                if let Some(hook) = on_panic {
                    hook(payload.as_ref());
                }
            }
        }
    })
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_normal_completion_releases_counter() {
        let wg = WaitGroup::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        spawn_supervised("normal", Some(wg.clone()), None, async move {
            ran_clone.store(true, Ordering::SeqCst);
        });

        wg.wait().await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn test_panic_releases_counter_and_wait_returns() {
        let wg = WaitGroup::new();

        spawn_supervised("panicking", Some(wg.clone()), None, async {
            panic!("boom in task");
        });

        // Must not hang: the drop guard releases the counter during unwind.
        tokio::time::timeout(Duration::from_secs(5), wg.wait())
            .await
            .unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn test_panic_invokes_hook_with_payload() {
        let wg = WaitGroup::new();
        let seen = Arc::new(Mutex::new(None::<String>));
        let seen_clone = Arc::clone(&seen);
        let hook: PanicHook = Arc::new(move |payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .unwrap_or_default();
            *seen_clone.lock().unwrap() = Some(message);
        });

        spawn_supervised("hooked", Some(wg.clone()), Some(hook), async {
            panic!("observable payload");
        });

        wg.wait().await;
        assert_eq!(seen.lock().unwrap().as_deref(), Some("observable payload"));
    }

    #[tokio::test]
    async fn test_nil_counter_and_hook_are_valid() {
        let handle = spawn_supervised("bare", None, None, async {});
        handle.await.unwrap();

        // A panicking task without counter or hook is also fine.
        let handle = spawn_supervised("bare-panic", None, None, async {
            panic!("ignored");
        });
        // The supervised wrapper swallows the panic, so join succeeds.
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_group_tracks_many_tasks() {
        let wg = WaitGroup::new();
        let completed = Arc::new(AtomicUsize::new(0));

        for i in 0..50 {
            let completed = Arc::clone(&completed);
            spawn_supervised(format!("task-{i}"), Some(wg.clone()), None, async move {
                tokio::task::yield_now().await;
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }

        wg.wait().await;
        assert_eq!(completed.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let wg = WaitGroup::new();
        tokio::time::timeout(Duration::from_millis(100), wg.wait())
            .await
            .unwrap();
    }
}
