use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Every error is local to one job and one call; none of them leave the
/// scheduler in an unusable state.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No job with the given name is registered.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// `register` was called with a name that is already taken.
    #[error("Job already exists: {name}")]
    JobAlreadyExists { name: String },

    /// `start` was called on a job that is not fully stopped.
    #[error("Job must be stopped: {name}")]
    JobMustBeStopped { name: String },

    /// The job is executing (or its timer already fired); retry later.
    #[error("Job is running: {name}")]
    JobIsRunning { name: String },

    /// The cron expression could not be parsed.
    #[error("Cron parse error: {0}")]
    InvalidCron(String),

    /// The cron expression is valid but has no occurrence in the future.
    #[error("Schedule has no future occurrence: {expression}")]
    ScheduleExhausted { expression: String },

    /// The scheduler was created outside a Tokio runtime.
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),
}

impl SchedulerError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::JobAlreadyExists { .. } => "JOB_ALREADY_EXISTS",
            SchedulerError::JobMustBeStopped { .. } => "JOB_MUST_BE_STOPPED",
            SchedulerError::JobIsRunning { .. } => "JOB_IS_RUNNING",
            SchedulerError::InvalidCron(_) => "INVALID_CRON",
            SchedulerError::ScheduleExhausted { .. } => "SCHEDULE_EXHAUSTED",
            SchedulerError::NoRuntime(_) => "NO_RUNTIME",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
