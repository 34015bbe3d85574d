use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

/// A parsed cron expression together with the text it was parsed from.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    inner: cron::Schedule,
}

impl CronSchedule {
    /// Parse a cron expression.
    ///
    /// Accepts:
    /// - 5-field Unix cron: `minute hour day month weekday` (fires at second 0)
    /// - 6-field cron with seconds: `second minute hour day month weekday`
    /// - 7-field cron with seconds and year
    /// - shorthands such as `@hourly` or `@daily`
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = normalize(expression.trim());
        let inner = cron::Schedule::from_str(&normalized)
            .map_err(|e| SchedulerError::InvalidCron(format!("{expression:?}: {e}")))?;
        Ok(Self {
            expression: expression.trim().to_string(),
            inner,
        })
    }

    /// The expression as supplied by the caller.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next occurrence strictly after `from`.
    ///
    /// Returns `ScheduleExhausted` when the expression has no occurrence left
    /// (e.g. a year field entirely in the past).
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.inner
            .after(&from)
            .next()
            .ok_or_else(|| SchedulerError::ScheduleExhausted {
                expression: self.expression.clone(),
            })
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Bring a 5-field Unix expression into the 7-field form the `cron` crate
/// expects by pinning seconds to 0 and allowing any year. Everything else is
/// handed to the parser untouched so it can report its own error.
fn normalize(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression} *")
    } else {
        expression.to_string()
    }
}
