//! Task scheduling primitives.
//!
//! A [`Dispatcher`] spawns compute tasks on the tokio runtime and runs
//! blocking low-level client calls on the IO pool. A process-wide
//! interrupt flag is observed at every suspension point. The
//! [`IoTracker`] counts outstanding I/O so shutdown and revocation can
//! drain in-flight work with a bounded wait.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::Error;

/// Spawns engine tasks and carries the process-wide interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    interrupt: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Creates a dispatcher with a fresh interrupt flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dispatcher sharing an existing interrupt flag.
    #[must_use]
    pub fn with_interrupt(interrupt: Arc<AtomicBool>) -> Self {
        Self { interrupt }
    }

    /// Returns the shared interrupt flag.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Sets the interrupt flag; engines drain and terminate.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the interrupt flag is set.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Spawns a compute task (deserialization, user callbacks).
    pub fn spawn_compute<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(future)
    }

    /// Runs a blocking low-level client call on the IO pool.
    ///
    /// # Errors
    ///
    /// Returns a `Cancelled` error when the IO task was aborted before
    /// completion.
    pub async fn run_io<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| Error::cancelled(format!("io task aborted: {e}")))
    }
}

#[derive(Debug, Default)]
struct TrackerShared {
    count: AtomicUsize,
    notify: Notify,
}

/// Reference-counted signal of outstanding I/O for graceful drain.
///
/// Each unit of in-flight work holds an [`IoGuard`]; dropping the guard
/// decrements the count and wakes drain waiters.
#[derive(Debug, Clone, Default)]
pub struct IoTracker {
    shared: Arc<TrackerShared>,
}

impl IoTracker {
    /// Creates an idle tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a guard for one unit of in-flight work.
    #[must_use]
    pub fn guard(&self) -> IoGuard {
        self.shared.count.fetch_add(1, Ordering::AcqRel);
        IoGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns the number of outstanding guards.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.count.load(Ordering::Acquire)
    }

    /// Waits until all guards are dropped, up to `timeout`.
    ///
    /// Returns `true` when the tracker went idle, `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            if self.in_flight() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

/// One unit of tracked in-flight work; dropping it signals completion.
#[derive(Debug)]
pub struct IoGuard {
    shared: Arc<TrackerShared>,
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        if self.shared.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_io_returns_value() {
        let dispatcher = Dispatcher::new();
        let value = dispatcher.run_io(|| 41 + 1).await.unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_interrupt_flag_shared() {
        let dispatcher = Dispatcher::new();
        let clone = dispatcher.clone();
        assert!(!clone.is_interrupted());
        dispatcher.interrupt();
        assert!(clone.is_interrupted());
    }

    #[tokio::test]
    async fn test_tracker_idle_immediately() {
        let tracker = IoTracker::new();
        assert!(tracker.wait_idle(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_tracker_waits_for_guard_drop() {
        let tracker = IoTracker::new();
        let guard = tracker.guard();
        assert_eq!(tracker.in_flight(), 1);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_tracker_times_out_with_held_guard() {
        let tracker = IoTracker::new();
        let _guard = tracker.guard();
        let start = Instant::now();
        assert!(!tracker.wait_idle(Duration::from_millis(50)).await);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
