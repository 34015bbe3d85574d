use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Callback invoked on every occurrence, with the job's payload.
pub type JobFn<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// Base lifecycle phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Timer armed, waiting for the next occurrence.
    Scheduled,
    /// Callback currently executing; no timer armed.
    Running,
    /// No timer, not running. Stays here until started again.
    Stopped,
}

/// Phase plus the stop/delete requests recorded while the job was busy.
///
/// The modifiers survive the whole `Running` period so a request that arrives
/// mid-invocation is honoured once the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobState {
    phase: Phase,
    stopping: bool,
    deleting: bool,
}

impl JobState {
    pub const STOPPED: JobState = JobState::idle(Phase::Stopped);
    pub const SCHEDULED: JobState = JobState::idle(Phase::Scheduled);
    pub const RUNNING: JobState = JobState::idle(Phase::Running);

    const fn idle(phase: Phase) -> Self {
        Self {
            phase,
            stopping: false,
            deleting: false,
        }
    }

    /// Same phase with the stop request recorded.
    pub const fn with_stopping(self) -> Self {
        Self {
            stopping: true,
            ..self
        }
    }

    /// Same phase with the delete request recorded.
    pub const fn with_deleting(self) -> Self {
        Self {
            deleting: true,
            ..self
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// A stop has been requested and will take effect when the job is idle.
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// A delete has been requested and will take effect when the job is idle.
    pub fn is_deleting(&self) -> bool {
        self.deleting
    }

    /// Fully stopped: the only state from which a job may be started or removed.
    pub fn is_stopped(&self) -> bool {
        *self == Self::STOPPED
    }

    /// Exactly `Scheduled`, with no pending request. The job owns an armed
    /// timer in this state and only in this state.
    pub fn is_scheduled(&self) -> bool {
        *self == Self::SCHEDULED
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Scheduled => "scheduled",
            Phase::Running => "running",
            Phase::Stopped => "stopped",
        };
        write!(f, "{phase}")?;
        if self.stopping {
            write!(f, "|stopping")?;
        }
        if self.deleting {
            write!(f, "|deleting")?;
        }
        Ok(())
    }
}

/// Point-in-time description of a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    /// Cron expression as supplied at registration or last update.
    pub cron: String,
    pub state: JobState,
    /// Next planned occurrence. Stale while the job is running.
    pub next_run: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifiers_compose() {
        let state = JobState::RUNNING.with_stopping().with_deleting();
        assert!(state.is_running());
        assert!(state.is_stopping());
        assert!(state.is_deleting());
        assert_eq!(state.to_string(), "running|stopping|deleting");
    }

    #[test]
    fn scheduled_with_request_is_not_scheduled() {
        let state = JobState::SCHEDULED.with_stopping();
        assert_eq!(state.phase(), Phase::Scheduled);
        assert!(!state.is_scheduled());
        assert!(!state.is_stopped());
    }

    #[test]
    fn display_plain_phases() {
        assert_eq!(JobState::STOPPED.to_string(), "stopped");
        assert_eq!(JobState::SCHEDULED.to_string(), "scheduled");
    }
}
