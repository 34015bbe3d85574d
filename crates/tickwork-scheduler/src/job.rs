//! Per-job data and the per-job lock.
//!
//! Lock order: a job lock may be held while taking the registry lock (the
//! removal path), never the other way around. [`JobGuard`] counts the job
//! locks held by the current thread so registry lookups can assert the rule,
//! and the removal path takes a `&JobGuard` as proof that the job lock is
//! already held.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::{
    schedule::CronSchedule,
    timer::Timer,
    types::{JobFn, JobInfo, JobState},
};

thread_local! {
    static JOB_LOCKS_HELD: Cell<usize> = const { Cell::new(0) };
}

/// True when the current thread holds at least one job lock.
pub(crate) fn job_lock_held() -> bool {
    JOB_LOCKS_HELD.with(|held| held.get() > 0)
}

pub(crate) struct Job<T> {
    pub(crate) name: String,
    inner: Mutex<JobInner<T>>,
}

pub(crate) struct JobInner<T> {
    pub(crate) schedule: CronSchedule,
    pub(crate) callback: JobFn<T>,
    pub(crate) payload: Arc<T>,
    pub(crate) state: JobState,
    pub(crate) next_run: DateTime<Utc>,
    /// Present exactly while `state` is `Scheduled` with no pending request.
    pub(crate) timer: Option<Timer>,
    /// Set once the job has left the registry; late callers treat it as gone.
    pub(crate) removed: bool,
}

impl<T> Job<T> {
    pub(crate) fn new(
        name: &str,
        schedule: CronSchedule,
        callback: JobFn<T>,
        payload: T,
        next_run: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(JobInner {
                schedule,
                callback,
                payload: Arc::new(payload),
                state: JobState::STOPPED,
                next_run,
                timer: None,
                removed: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> JobGuard<'_, T> {
        // Callbacks never run under this lock, so poisoning can only come from
        // a bug in the scheduler itself; the state is still consistent.
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        JOB_LOCKS_HELD.with(|held| held.set(held.get() + 1));
        JobGuard { inner }
    }
}

impl<T> JobInner<T> {
    pub(crate) fn info(&self, name: &str) -> JobInfo {
        JobInfo {
            name: name.to_string(),
            cron: self.schedule.expression().to_string(),
            state: self.state,
            next_run: self.next_run,
        }
    }
}

pub(crate) struct JobGuard<'a, T> {
    inner: MutexGuard<'a, JobInner<T>>,
}

impl<T> Deref for JobGuard<'_, T> {
    type Target = JobInner<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for JobGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<T> Drop for JobGuard<'_, T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(
                self.inner.timer.is_some(),
                self.inner.state.is_scheduled(),
                "timer handle must exist exactly while the job is scheduled (state: {})",
                self.inner.state,
            );
        }
        JOB_LOCKS_HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job<()> {
        let schedule = CronSchedule::parse("1 0 0 1 1 * 2099").unwrap();
        let next = schedule.next_after(Utc::now()).unwrap();
        Job::new("a", schedule, Arc::new(|_: &()| {}), (), next)
    }

    #[test]
    fn new_job_is_stopped() {
        let job = job();
        let guard = job.lock();
        assert!(guard.state.is_stopped());
        assert!(guard.timer.is_none());
        assert!(!guard.removed);
    }

    #[test]
    fn guard_tracks_held_locks() {
        let a = job();
        let b = job();
        assert!(!job_lock_held());
        {
            let _a = a.lock();
            assert!(job_lock_held());
            {
                let _b = b.lock();
                assert!(job_lock_held());
            }
            assert!(job_lock_held());
        }
        assert!(!job_lock_held());
    }

    #[test]
    fn info_reflects_fields() {
        let job = job();
        let guard = job.lock();
        let info = guard.info(&job.name);
        assert_eq!(info.name, "a");
        assert_eq!(info.cron, "1 0 0 1 1 * 2099");
        assert_eq!(info.state, JobState::STOPPED);
    }
}
