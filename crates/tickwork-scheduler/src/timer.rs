//! One-shot timer whose cancellation reports whether it beat the fire.
//!
//! The fire path and [`Timer::stop`] race on a single compare-and-swap, so
//! exactly one of them wins: either the callback is handed to a blocking
//! thread, or `stop` returns `true` and the callback is never run.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

pub(crate) struct Timer {
    state: Arc<AtomicU8>,
    task: AbortHandle,
}

impl Timer {
    /// Arm a timer that runs `f` on the blocking pool once `delay` has passed.
    pub(crate) fn after<F>(runtime: &Handle, delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let fire_state = Arc::clone(&state);

        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if fire_state
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // User callbacks are synchronous and may block arbitrarily long.
                tokio::task::spawn_blocking(f);
            }
        });

        Self {
            state,
            task: task.abort_handle(),
        }
    }

    /// Cancel the timer. Returns `true` if the fire was prevented, `false` if
    /// the timer had already fired (or was already cancelled).
    pub(crate) fn stop(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.task.abort();
        }
        cancelled
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[tokio::test(flavor = "multi_thread")]
    async fn fires_after_delay() {
        let (tx, rx) = mpsc::channel();
        let timer = Timer::after(&Handle::current(), Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_ok());
        assert!(!timer.stop(), "stop after fire must report the fire");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_before_fire_wins() {
        let (tx, rx) = mpsc::channel::<()>();
        let timer = Timer::after(&Handle::current(), Duration::from_secs(60), move || {
            tx.send(()).unwrap();
        });

        assert!(timer.stop());
        assert!(!timer.stop(), "second stop has nothing left to cancel");
        drop(timer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drop_cancels_pending_timer() {
        let (tx, rx) = mpsc::channel::<()>();
        let timer = Timer::after(&Handle::current(), Duration::from_millis(30), move || {
            tx.send(()).unwrap();
        });
        drop(timer);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }
}
