//! One-shot cancellable timers
//!
//! Backs the breaker's cooldown: a single deferred callback per trip, owned
//! through a [`TimerHandle`] so it can be cancelled when the breaker re-trips,
//! resets, or goes away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Handle to a scheduled one-shot timer
///
/// Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the timer
    ///
    /// The callback will not run if it has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    /// Check if the timer has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Check if the timer task has completed, fired or not
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run `callback` once after `delay`
///
/// The timer is spawned on `runtime` when given, otherwise on the runtime of
/// the calling thread. Returns `None` when neither is available; nothing is
/// scheduled in that case.
pub fn schedule<F>(runtime: Option<&Handle>, delay: Duration, callback: F) -> Option<TimerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let runtime = match runtime {
        Some(handle) => handle.clone(),
        None => Handle::try_current().ok()?,
    };
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);

    let task = runtime.spawn(async move {
        sleep(delay).await;
        if !flag.load(Ordering::SeqCst) {
            callback();
        }
    });

    Some(TimerHandle { cancelled, task })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let handle = schedule(None, Duration::from_millis(10), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .expect("inside a runtime");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!handle.is_cancelled());
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_cancelled() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let handle = schedule(None, Duration::from_millis(50), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .expect("inside a runtime");

        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let handle = schedule(None, Duration::from_millis(50), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_schedule_outside_runtime() {
        assert!(schedule(None, Duration::from_millis(1), || {}).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schedule_from_plain_thread_with_handle() {
        let runtime = Handle::current();
        let (fired_tx, fired_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = std::thread::spawn(move || {
            schedule(Some(&runtime), Duration::from_millis(10), move || {
                let _ = fired_tx.send(());
            })
        })
        .join()
        .expect("scheduling thread finished")
        .expect("timer spawned on the given runtime");

        tokio::time::timeout(Duration::from_secs(5), fired_rx)
            .await
            .expect("timer fired")
            .expect("callback ran");
        assert!(!handle.is_cancelled());
    }
}
