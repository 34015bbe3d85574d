//! `tickwork-scheduler` — in-process recurring-job scheduler on Tokio.
//!
//! # Overview
//!
//! Jobs are registered by name with a cron expression, a callback and a
//! payload. A started job arms a one-shot timer for its next occurrence; when
//! the timer fires the callback runs on Tokio's blocking pool, the next
//! occurrence is computed and the timer is re-armed. Jobs run until they are
//! stopped or deleted. Nothing is persisted.
//!
//! # Job states
//!
//! | State                       | Meaning                                           |
//! |-----------------------------|---------------------------------------------------|
//! | `stopped`                   | Idle; may be started, updated freely or deleted   |
//! | `scheduled`                 | Timer armed for `next_run`                        |
//! | `running`                   | Callback executing                                |
//! | `running\|stopping`         | Will stop once the callback returns               |
//! | `running\|stopping\|deleting` | Will stop and be removed once the callback returns |
//!
//! A stop or delete never interrupts a running callback. If it lands after
//! the timer fired but before the callback started, that occurrence is
//! skipped.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tickwork_scheduler::Scheduler;
//!
//! #[tokio::main]
//! async fn main() -> tickwork_scheduler::Result<()> {
//!     let scheduler = Scheduler::new()?;
//!
//!     // Every second (6-field cron with seconds).
//!     scheduler.register(
//!         "tick",
//!         "* * * * * *",
//!         |count: &AtomicU64| {
//!             count.fetch_add(1, Ordering::Relaxed);
//!         },
//!         AtomicU64::new(0),
//!     )?;
//!     scheduler.start("tick")?;
//!
//!     tokio::time::sleep(Duration::from_secs(3)).await;
//!     scheduler.stop_all_and_wait(Duration::from_secs(1)).await;
//!
//!     let count: Arc<AtomicU64> = scheduler.payload("tick")?;
//!     println!("ran {} times", count.load(Ordering::Relaxed));
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
mod job;
mod quiesce;
pub mod schedule;
mod timer;
pub mod types;

pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use schedule::CronSchedule;
pub use types::{JobFn, JobInfo, JobState, Phase};
