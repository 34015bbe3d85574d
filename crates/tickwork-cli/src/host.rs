//! Jobs declared in the config file and what they do when they fire.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tickwork_core::JobConfig;
use tickwork_scheduler::{CronSchedule, Scheduler};
use tracing::info;

/// Payload of a config-declared job: logs its message every time it fires.
pub struct Announcement {
    pub name: String,
    pub message: String,
    pub fired: AtomicU64,
}

fn announce(job: &Announcement) {
    let fired = job.fired.fetch_add(1, Ordering::Relaxed) + 1;
    if job.message.is_empty() {
        info!(job = %job.name, fired, "job fired");
    } else {
        info!(job = %job.name, fired, "{}", job.message);
    }
}

/// Register every configured job and start those marked `start = true`.
///
/// Returns the number of started jobs.
pub fn register_all(
    scheduler: &Scheduler<Announcement>,
    jobs: &[JobConfig],
) -> tickwork_scheduler::Result<usize> {
    let mut started = 0;
    for job in jobs {
        let payload = Announcement {
            name: job.name.clone(),
            message: job.message.clone(),
            fired: AtomicU64::new(0),
        };
        scheduler.register(&job.name, &job.cron, announce, payload)?;
        if job.start {
            scheduler.start(&job.name)?;
            started += 1;
        }
    }
    Ok(started)
}

/// How many times each job fired, sorted by name.
pub fn fired_counts(scheduler: &Scheduler<Announcement>) -> Vec<(String, u64)> {
    let mut names = scheduler.list_names();
    names.sort();
    names
        .into_iter()
        .filter_map(|name| {
            let fired = scheduler.payload(&name).ok()?.fired.load(Ordering::Relaxed);
            Some((name, fired))
        })
        .collect()
}

/// Result of checking one configured job without running it.
#[derive(Debug, Serialize)]
pub struct PlannedRun {
    pub name: String,
    pub cron: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse every configured cron expression and compute its next run after `from`.
pub fn plan(jobs: &[JobConfig], from: DateTime<Utc>) -> Vec<PlannedRun> {
    jobs.iter()
        .map(|job| {
            let next = CronSchedule::parse(&job.cron).and_then(|s| s.next_after(from));
            let (next_run, error) = match next {
                Ok(at) => (Some(at), None),
                Err(e) => (None, Some(e.to_string())),
            };
            PlannedRun {
                name: job.name.clone(),
                cron: job.cron.clone(),
                next_run,
                error,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tickwork_scheduler::JobState;

    fn job(name: &str, cron: &str, start: bool) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            cron: cron.to_string(),
            message: String::new(),
            start,
        }
    }

    #[tokio::test]
    async fn register_all_starts_marked_jobs() {
        let scheduler = Scheduler::new().unwrap();
        let jobs = vec![
            job("report", "0 3 * * *", true),
            job("cleanup", "0 4 * * *", false),
        ];

        assert_eq!(register_all(&scheduler, &jobs).unwrap(), 1);
        assert_eq!(scheduler.state("report").unwrap(), JobState::SCHEDULED);
        assert_eq!(scheduler.state("cleanup").unwrap(), JobState::STOPPED);
        assert_eq!(
            fired_counts(&scheduler),
            vec![("cleanup".to_string(), 0), ("report".to_string(), 0)]
        );

        scheduler.stop_all();
        assert_eq!(scheduler.not_stopped_count(), 0);
    }

    #[tokio::test]
    async fn register_all_stops_at_first_bad_job() {
        let scheduler = Scheduler::new().unwrap();
        let jobs = vec![job("ok", "0 3 * * *", false), job("bad", "nonsense", true)];

        let err = register_all(&scheduler, &jobs).unwrap_err();
        assert_eq!(err.code(), "INVALID_CRON");
        assert_eq!(scheduler.list_names(), vec!["ok".to_string()]);
    }

    #[test]
    fn plan_reports_next_run_and_errors() {
        let from = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let planned = plan(&[job("noon", "0 12 * * *", true), job("bad", "x", true)], from);

        assert_eq!(
            planned[0].next_run,
            Some(Utc.with_ymd_and_hms(2025, 5, 2, 12, 0, 0).unwrap())
        );
        assert!(planned[0].error.is_none());
        assert!(planned[1].next_run.is_none());
        assert!(planned[1].error.as_deref().unwrap().starts_with("Cron parse error"));
    }
}
