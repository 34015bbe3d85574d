//! Scheduler-wide "all jobs are stopped" tracking.
//!
//! The atomic counter is the ground truth; the bounded channel only wakes a
//! waiter so it re-reads the counter. A full channel drops the wake, which is
//! harmless because a wake is already queued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};

pub(crate) struct Quiescence {
    not_stopped: AtomicUsize,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<mpsc::Receiver<()>>,
}

impl Quiescence {
    pub(crate) fn new(capacity: usize) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(capacity.max(1));
        Self {
            not_stopped: AtomicUsize::new(0),
            wake_tx,
            wake_rx: Mutex::new(wake_rx),
        }
    }

    /// Number of jobs that have been started and have not yet fully stopped.
    pub(crate) fn count(&self) -> usize {
        self.not_stopped.load(Ordering::Acquire)
    }

    /// A job left `Stopped`.
    pub(crate) fn job_started(&self) {
        self.not_stopped.fetch_add(1, Ordering::AcqRel);
    }

    /// A job reached `Stopped`. Must be paired with exactly one `job_started`.
    pub(crate) fn job_stopped(&self) {
        let previous = self.not_stopped.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "not-stopped counter underflow");
        self.wake();
    }

    fn wake(&self) {
        // try_send never blocks; Full means a wake is already pending.
        let _ = self.wake_tx.try_send(());
    }

    /// Wait until the counter reaches zero or `timeout` elapses.
    ///
    /// Returns `true` when every job has stopped.
    pub(crate) async fn wait(&self, timeout: Duration) -> bool {
        if self.count() == 0 {
            return true;
        }
        let deadline = Instant::now() + timeout;

        let drained = match timeout_at(deadline, self.wake_rx.lock()).await {
            Ok(mut wake_rx) => loop {
                if self.count() == 0 {
                    break true;
                }
                match timeout_at(deadline, wake_rx.recv()).await {
                    Ok(Some(())) => continue,
                    // The sender lives as long as `self`.
                    Ok(None) => break self.count() == 0,
                    Err(_) => break false,
                }
            },
            Err(_) => false,
        };

        // We may have consumed the wake another waiter was counting on.
        self.wake();
        drained
    }
}
