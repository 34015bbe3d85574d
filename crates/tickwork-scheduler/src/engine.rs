use std::collections::HashMap;
use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tickwork_core::SchedulerConfig;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Result, SchedulerError},
    job::{job_lock_held, Job, JobGuard},
    quiesce::Quiescence,
    schedule::CronSchedule,
    timer::Timer,
    types::{JobFn, JobInfo, JobState},
};

/// In-process recurring-job scheduler.
///
/// Cloning is cheap and every clone drives the same set of jobs. Each fired
/// occurrence runs its callback on Tokio's blocking pool with no scheduler
/// lock held, so callbacks may call back into the scheduler (e.g. to stop
/// themselves). Dropping the last clone cancels every pending timer.
pub struct Scheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T> {
    /// Protects the name → job mapping only; job fields live behind each job's own lock.
    jobs: RwLock<HashMap<String, Arc<Job<T>>>>,
    quiescence: Quiescence,
    runtime: Handle,
    catch_panics: bool,
}

impl<T: Send + Sync + 'static> Scheduler<T> {
    /// Create a scheduler with default settings on the current Tokio runtime.
    pub fn new() -> Result<Self> {
        Self::with_config(&SchedulerConfig::default())
    }

    /// Create a scheduler on the current Tokio runtime.
    ///
    /// Fails with `NoRuntime` when called outside a runtime context.
    pub fn with_config(config: &SchedulerConfig) -> Result<Self> {
        let runtime =
            Handle::try_current().map_err(|e| SchedulerError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a scheduler whose timers and callbacks run on `runtime`.
    pub fn with_runtime(config: &SchedulerConfig, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: RwLock::new(HashMap::new()),
                quiescence: Quiescence::new(config.wake_capacity),
                runtime,
                catch_panics: config.catch_panics,
            }),
        }
    }

    /// Register a new job in the `Stopped` state.
    ///
    /// The first run is the next occurrence of `cron` after now; call
    /// [`start`](Self::start) to begin scheduling.
    pub fn register<F>(&self, name: &str, cron: &str, callback: F, payload: T) -> Result<()>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let schedule = CronSchedule::parse(cron)?;
        let next_run = schedule.next_after(Utc::now())?;
        let callback: JobFn<T> = Arc::new(callback);

        // Held across check and insert so two registrations cannot both win.
        let mut jobs = self.shared.write_jobs();
        if jobs.contains_key(name) {
            return Err(SchedulerError::JobAlreadyExists {
                name: name.to_string(),
            });
        }
        jobs.insert(
            name.to_string(),
            Arc::new(Job::new(name, schedule, callback, payload, next_run)),
        );

        info!(job = %name, %cron, %next_run, "job registered");
        Ok(())
    }

    /// Start a stopped job. It will run at its next run time.
    #[instrument(skip(self))]
    pub fn start(&self, name: &str) -> Result<()> {
        let job = self.shared.lookup(name)?;
        let mut guard = lock_live(&job)?;

        if !guard.state.is_stopped() {
            return Err(SchedulerError::JobMustBeStopped {
                name: name.to_string(),
            });
        }

        guard.state = JobState::SCHEDULED;
        self.shared.quiescence.job_started();
        let next_run = guard.next_run;
        guard.timer = Some(self.shared.arm(&job, next_run));

        info!(job = %name, %next_run, "job started");
        Ok(())
    }

    /// Stop a job from running again.
    ///
    /// An idle job stops immediately. A running job finishes its current
    /// invocation and then stops. Stopping a stopped job is a no-op.
    #[instrument(skip(self))]
    pub fn stop(&self, name: &str) -> Result<()> {
        let job = self.shared.lookup(name)?;
        let mut guard = lock_live(&job)?;
        self.shared.stop_locked(&job, &mut guard);
        Ok(())
    }

    /// Stop and remove a job.
    ///
    /// An idle job is removed immediately. A running job finishes its current
    /// invocation and is removed afterwards; until then it stays visible with
    /// the `deleting` modifier set.
    #[instrument(skip(self))]
    pub fn delete(&self, name: &str) -> Result<()> {
        let job = self.shared.lookup(name)?;
        let mut guard = lock_live(&job)?;
        self.shared.stop_locked(&job, &mut guard);

        if guard.state.is_stopped() {
            self.shared.unregister(&job, &mut guard);
            info!(job = %name, "job deleted");
        } else {
            guard.state = guard.state.with_deleting();
            debug!(job = %name, state = %guard.state, "delete deferred until the current run finishes");
        }
        Ok(())
    }

    /// Replace the job's cron expression.
    ///
    /// Takes effect the next time the job computes its next run; an already
    /// armed timer keeps its time.
    pub fn update_cron(&self, name: &str, cron: &str) -> Result<()> {
        let job = self.shared.lookup(name)?;
        let schedule = CronSchedule::parse(cron)?;

        let mut guard = lock_live(&job)?;
        guard.schedule = schedule;
        debug!(job = %name, %cron, "cron updated");
        Ok(())
    }

    /// Set the time of the job's next run.
    ///
    /// Always succeeds on a stopped job. On a scheduled job the pending timer
    /// is re-armed for `next_run`. Fails with `JobIsRunning` while the job is
    /// executing or its timer has already fired; retry once the run is over.
    pub fn update_next_run(&self, name: &str, next_run: DateTime<Utc>) -> Result<()> {
        let job = self.shared.lookup(name)?;
        let mut guard = lock_live(&job)?;

        if guard.state.is_stopped() {
            guard.next_run = next_run;
            debug!(job = %name, %next_run, "next run updated");
            return Ok(());
        }

        let cancelled = guard.state.is_scheduled()
            && guard.timer.as_ref().is_some_and(|timer| timer.stop());
        if !cancelled {
            // Running, or the fired timer is already on its way to the run routine.
            return Err(SchedulerError::JobIsRunning {
                name: name.to_string(),
            });
        }

        guard.next_run = next_run;
        guard.timer = Some(self.shared.arm(&job, next_run));
        debug!(job = %name, %next_run, "next run updated and timer re-armed");
        Ok(())
    }

    /// Replace the job's callback and payload together.
    pub fn update_function<F>(&self, name: &str, callback: F, payload: T) -> Result<()>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let job = self.shared.lookup(name)?;
        let callback: JobFn<T> = Arc::new(callback);

        let mut guard = lock_live(&job)?;
        let old_callback = std::mem::replace(&mut guard.callback, callback);
        let old_payload = std::mem::replace(&mut guard.payload, Arc::new(payload));
        drop(guard);
        debug!(job = %name, "function updated");

        // Their destructors are caller code and may re-enter the scheduler.
        drop(old_callback);
        drop(old_payload);
        Ok(())
    }

    /// Current state of the job.
    pub fn state(&self, name: &str) -> Result<JobState> {
        let job = self.shared.lookup(name)?;
        let guard = lock_live(&job)?;
        Ok(guard.state)
    }

    /// The payload passed to the job's callback.
    pub fn payload(&self, name: &str) -> Result<Arc<T>> {
        let job = self.shared.lookup(name)?;
        let guard = lock_live(&job)?;
        Ok(Arc::clone(&guard.payload))
    }

    /// Time of the job's next planned run.
    pub fn next_run(&self, name: &str) -> Result<DateTime<Utc>> {
        let job = self.shared.lookup(name)?;
        let guard = lock_live(&job)?;
        Ok(guard.next_run)
    }

    /// Snapshot of a single job.
    pub fn describe(&self, name: &str) -> Result<JobInfo> {
        let job = self.shared.lookup(name)?;
        let guard = lock_live(&job)?;
        Ok(guard.info(&job.name))
    }

    /// Snapshot of every registered job, in no particular order.
    pub fn describe_all(&self) -> Vec<JobInfo> {
        self.shared
            .snapshot()
            .iter()
            .filter_map(|job| lock_live(job).ok().map(|guard| guard.info(&job.name)))
            .collect()
    }

    /// Names of all registered jobs, in no particular order.
    pub fn list_names(&self) -> Vec<String> {
        self.shared.read_jobs().keys().cloned().collect()
    }

    /// Number of jobs that have been started and have not fully stopped yet.
    pub fn not_stopped_count(&self) -> usize {
        self.shared.quiescence.count()
    }

    /// Stop every job. Does not wait for running callbacks to finish.
    pub fn stop_all(&self) {
        let jobs = self.shared.snapshot();
        for job in &jobs {
            if let Ok(mut guard) = lock_live(job) {
                self.shared.stop_locked(job, &mut guard);
            }
        }
        info!(jobs = jobs.len(), "stop requested for all jobs");
    }

    /// Stop every job and wait until all of them have stopped, or `timeout`
    /// has elapsed.
    ///
    /// Returns `true` when everything stopped in time. On timeout the
    /// remaining jobs keep draining in the background; running callbacks are
    /// never interrupted.
    pub async fn stop_all_and_wait(&self, timeout: Duration) -> bool {
        self.stop_all();

        let drained = self.shared.quiescence.wait(timeout).await;
        if drained {
            info!("all jobs stopped");
        } else {
            warn!(
                remaining = self.shared.quiescence.count(),
                ?timeout,
                "timed out waiting for jobs to stop"
            );
        }
        drained
    }
}

/// Lock a job looked up earlier, failing if it has been removed since.
fn lock_live<T>(job: &Job<T>) -> Result<JobGuard<'_, T>> {
    let guard = job.lock();
    if guard.removed {
        return Err(SchedulerError::JobNotFound {
            name: job.name.clone(),
        });
    }
    Ok(guard)
}

impl<T: Send + Sync + 'static> Shared<T> {
    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Job<T>>>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Job<T>>>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Job<T>>> {
        debug_assert!(
            !job_lock_held(),
            "registry lookup while holding a job lock inverts the lock order"
        );
        self.read_jobs()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })
    }

    /// All jobs, taken under the read lock and returned after releasing it,
    /// so callers can lock each job without holding the registry.
    fn snapshot(&self) -> Vec<Arc<Job<T>>> {
        debug_assert!(
            !job_lock_held(),
            "registry snapshot while holding a job lock inverts the lock order"
        );
        self.read_jobs().values().cloned().collect()
    }

    /// Remove `job` from the registry. The `held` guard proves the caller
    /// already owns the job lock, which is always taken before the registry lock.
    fn unregister(&self, job: &Job<T>, held: &mut JobGuard<'_, T>) {
        held.removed = true;
        let mut jobs = self.write_jobs();
        // Only remove our own entry; the name may have been reused.
        if jobs
            .get(&job.name)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), job))
        {
            jobs.remove(&job.name);
        }
    }

    /// Arm a timer that runs `job` at `at` (immediately if `at` has passed).
    fn arm(self: &Arc<Self>, job: &Arc<Job<T>>, at: DateTime<Utc>) -> Timer {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let shared = Arc::downgrade(self);
        let fired = Arc::clone(job);

        debug!(job = %job.name, ?delay, "timer armed");
        Timer::after(&self.runtime, delay, move || {
            if let Some(shared) = shared.upgrade() {
                shared.run(&fired);
            }
        })
    }

    fn stop_locked(&self, job: &Job<T>, guard: &mut JobGuard<'_, T>) {
        if guard.state.is_stopped() {
            return;
        }
        if guard.state.is_running() {
            guard.state = guard.state.with_stopping();
            debug!(job = %job.name, "stop deferred until the current run finishes");
            return;
        }

        // Scheduled. A missing timer means an earlier cancel already lost the race.
        let cancelled = guard.timer.take().is_some_and(|timer| timer.stop());
        if cancelled {
            guard.state = JobState::STOPPED;
            self.quiescence.job_stopped();
            info!(job = %job.name, "job stopped");
        } else {
            // The timer fired and the run routine is waiting for this lock; it
            // will see the request and stop instead of invoking the callback.
            guard.state = guard.state.with_stopping();
            debug!(job = %job.name, "timer already fired; stop handed to the run routine");
        }
    }

    /// Apply a pending stop/delete request. Returns `true` if one was applied.
    fn finish_if_requested(&self, job: &Job<T>, guard: &mut JobGuard<'_, T>) -> bool {
        let deleting = guard.state.is_deleting();
        if !deleting && !guard.state.is_stopping() {
            return false;
        }

        guard.state = JobState::STOPPED;
        self.quiescence.job_stopped();
        if deleting {
            self.unregister(job, guard);
            info!(job = %job.name, "job deleted");
        } else {
            info!(job = %job.name, "job stopped");
        }
        true
    }

    /// Timer callback: invoke the job once and re-arm it.
    fn run(self: &Arc<Self>, job: &Arc<Job<T>>) {
        let mut guard = job.lock();
        guard.timer = None;
        // A request that arrived before we got the lock swallows this occurrence.
        if self.finish_if_requested(job, &mut guard) {
            return;
        }

        guard.state = JobState::RUNNING;
        let exhausted = match guard.schedule.next_after(Utc::now()) {
            Ok(next_run) => {
                guard.next_run = next_run;
                false
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "no further occurrences; job will stop after this run");
                true
            }
        };
        let callback = Arc::clone(&guard.callback);
        let payload = Arc::clone(&guard.payload);
        drop(guard);

        debug!(job = %job.name, "job firing");
        let panic = self.invoke(&job.name, &callback, &payload);
        drop(callback);
        drop(payload);

        self.reschedule(job, exhausted);

        // The job is settled; now let the panic reach the blocking task.
        if let Some(panic) = panic {
            if !self.catch_panics {
                resume_unwind(panic);
            }
        }
    }

    /// Settle a job after its callback returned: apply a pending stop/delete,
    /// stop an exhausted schedule, or re-arm for the next occurrence.
    fn reschedule(self: &Arc<Self>, job: &Arc<Job<T>>, exhausted: bool) {
        let mut guard = job.lock();
        if self.finish_if_requested(job, &mut guard) {
            return;
        }

        // Missed occurrences are skipped, never caught up.
        let now = Utc::now();
        let exhausted = exhausted
            || (guard.next_run <= now
                && match guard.schedule.next_after(now) {
                    Ok(next_run) => {
                        guard.next_run = next_run;
                        false
                    }
                    Err(e) => {
                        warn!(job = %job.name, error = %e, "no occurrence left after overrun");
                        true
                    }
                });
        if exhausted {
            guard.state = JobState::STOPPED;
            self.quiescence.job_stopped();
            info!(job = %job.name, "job stopped: schedule exhausted");
            return;
        }

        guard.state = JobState::SCHEDULED;
        let next_run = guard.next_run;
        guard.timer = Some(self.arm(job, next_run));
    }

    /// Run the callback, catching a panic so the job can still be settled.
    fn invoke(
        &self,
        name: &str,
        callback: &JobFn<T>,
        payload: &T,
    ) -> Option<Box<dyn Any + Send + 'static>> {
        let panic = catch_unwind(AssertUnwindSafe(|| callback(payload))).err()?;
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(job = %name, %reason, "job callback panicked");
        Some(panic)
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let jobs = self.jobs.get_mut().unwrap_or_else(PoisonError::into_inner);
        for job in jobs.values() {
            let mut guard = job.lock();
            if let Some(timer) = guard.timer.take() {
                timer.stop();
            }
            guard.state = JobState::STOPPED;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAR_FUTURE: &str = "1 0 0 1 1 * 2099";

    fn noop(_: &()) {}

    #[test]
    fn new_outside_runtime_fails() {
        let err = Scheduler::<()>::new().err().unwrap();
        assert_eq!(err.code(), "NO_RUNTIME");
    }

    #[tokio::test]
    async fn register_then_state_is_stopped() {
        let s = Scheduler::new().unwrap();
        s.register("a", FAR_FUTURE, noop, ()).unwrap();
        assert_eq!(s.state("a").unwrap(), JobState::STOPPED);
        assert_eq!(s.not_stopped_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_register_rejected() {
        let s = Scheduler::new().unwrap();
        s.register("a", FAR_FUTURE, noop, ()).unwrap();
        let err = s.register("a", FAR_FUTURE, noop, ()).unwrap_err();
        assert!(matches!(err, SchedulerError::JobAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn exhausted_schedule_rejected_at_register() {
        let s = Scheduler::new().unwrap();
        let err = s.register("a", "0 0 0 1 1 * 2020", noop, ()).unwrap_err();
        assert!(matches!(err, SchedulerError::ScheduleExhausted { .. }));
        assert!(s.list_names().is_empty());
    }

    #[tokio::test]
    async fn start_stop_pairs_counter() {
        let s = Scheduler::new().unwrap();
        s.register("a", FAR_FUTURE, noop, ()).unwrap();

        s.start("a").unwrap();
        assert_eq!(s.not_stopped_count(), 1);
        assert!(s.state("a").unwrap().is_scheduled());

        s.stop("a").unwrap();
        s.stop("a").unwrap();
        assert_eq!(s.not_stopped_count(), 0);
        assert!(s.state("a").unwrap().is_stopped());
    }

    #[tokio::test]
    async fn update_next_run_on_scheduled_rearms() {
        let s = Scheduler::new().unwrap();
        s.register("a", FAR_FUTURE, noop, ()).unwrap();
        s.start("a").unwrap();

        let later = Utc::now() + chrono::Duration::hours(9999);
        s.update_next_run("a", later).unwrap();
        assert_eq!(s.next_run("a").unwrap(), later);
        assert_eq!(s.state("a").unwrap(), JobState::SCHEDULED);
        assert_eq!(s.not_stopped_count(), 1);

        s.delete("a").unwrap();
        assert_eq!(s.not_stopped_count(), 0);
    }

    #[tokio::test]
    async fn stale_handle_reports_not_found() {
        let s = Scheduler::new().unwrap();
        s.register("a", FAR_FUTURE, noop, ()).unwrap();

        let job = s.shared.lookup("a").unwrap();
        s.delete("a").unwrap();
        assert!(matches!(lock_live(&job), Err(SchedulerError::JobNotFound { .. })));
    }

    #[tokio::test]
    async fn reregistered_name_survives_old_removal() {
        let s = Scheduler::new().unwrap();
        s.register("a", FAR_FUTURE, noop, ()).unwrap();
        let old = s.shared.lookup("a").unwrap();
        s.delete("a").unwrap();
        s.register("a", FAR_FUTURE, noop, ()).unwrap();

        let mut guard = old.lock();
        s.shared.unregister(&old, &mut guard);
        drop(guard);
        assert_eq!(s.list_names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn overrun_past_exhausted_rule_stops_job() {
        let s = Scheduler::new().unwrap();
        s.register("a", FAR_FUTURE, noop, ()).unwrap();
        // Parses, but has no occurrence after now.
        s.update_cron("a", "0 0 0 1 1 * 2020").unwrap();

        // Simulate a run that overran its planned next occurrence.
        let job = s.shared.lookup("a").unwrap();
        {
            let mut guard = job.lock();
            guard.state = JobState::RUNNING;
            guard.next_run = Utc::now() - chrono::Duration::seconds(1);
        }
        s.shared.quiescence.job_started();

        s.shared.reschedule(&job, false);
        assert_eq!(s.state("a").unwrap(), JobState::STOPPED);
        assert!(job.lock().timer.is_none());
        assert_eq!(s.not_stopped_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_scheduler_cancels_timers() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let s = Scheduler::new().unwrap();
            s.register(
                "a",
                "* * * * * *",
                |count: &Arc<AtomicUsize>| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                Arc::clone(&fired),
            )
            .unwrap();
            s.update_next_run("a", Utc::now() + chrono::Duration::milliseconds(100))
                .unwrap();
            s.start("a").unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
