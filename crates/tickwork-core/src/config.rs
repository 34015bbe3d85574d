use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WAKE_CAPACITY: usize = 2;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (tickwork.toml + TICKWORK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickworkConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Jobs registered by the host binary at startup.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Tuning knobs for a single `Scheduler` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Capacity of the bounded "a job finished stopping" wake channel.
    /// Wakes are hints only, so a small buffer is enough.
    #[serde(default = "default_wake_capacity")]
    pub wake_capacity: usize,
    /// How long hosts wait for running jobs to drain on shutdown.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Swallow panics raised by job callbacks. When off, the job is still
    /// settled first and the panic is then re-raised on the blocking task.
    #[serde(default = "bool_true")]
    pub catch_panics: bool,
}

impl SchedulerConfig {
    pub fn stop_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wake_capacity: DEFAULT_WAKE_CAPACITY,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            catch_panics: true,
        }
    }
}

/// A job declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Cron expression: 5 fields (Unix), 6 (with seconds) or 7 (with year).
    pub cron: String,
    /// Text logged every time the job fires.
    #[serde(default)]
    pub message: String,
    /// Start the job right after registering it (default: true).
    #[serde(default = "bool_true")]
    pub start: bool,
}

fn default_wake_capacity() -> usize {
    DEFAULT_WAKE_CAPACITY
}
fn default_stop_timeout_ms() -> u64 {
    DEFAULT_STOP_TIMEOUT_MS
}
fn bool_true() -> bool {
    true
}

impl TickworkConfig {
    /// Load config from a TOML file with TICKWORK_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `TICKWORK_SCHEDULER__STOP_TIMEOUT_MS=1000`. A missing file is not an
    /// error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let figment = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TICKWORK_").split("__"));
        let config = extract(figment)?;

        tracing::debug!(path = %path, jobs = config.jobs.len(), "config loaded");
        Ok(config)
    }
}

fn extract(figment: Figment) -> crate::error::Result<TickworkConfig> {
    let config: TickworkConfig = figment
        .extract()
        .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

    if config.scheduler.wake_capacity == 0 {
        return Err(crate::error::CoreError::Config(
            "scheduler.wake_capacity must be at least 1".to_string(),
        ));
    }
    Ok(config)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(src: &str) -> crate::error::Result<TickworkConfig> {
        extract(Figment::new().merge(Toml::string(src)))
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = from_toml("").unwrap();
        assert_eq!(config.scheduler.wake_capacity, DEFAULT_WAKE_CAPACITY);
        assert_eq!(config.scheduler.stop_timeout_ms, DEFAULT_STOP_TIMEOUT_MS);
        assert!(config.scheduler.catch_panics);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn jobs_section_parses() {
        let config = from_toml(
            r#"
            [scheduler]
            stop_timeout_ms = 250

            [[jobs]]
            name = "heartbeat"
            cron = "*/5 * * * * *"
            message = "still alive"

            [[jobs]]
            name = "nightly"
            cron = "0 3 * * *"
            start = false
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.stop_timeout().as_millis(), 250);
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.jobs[0].name, "heartbeat");
        assert!(config.jobs[0].start);
        assert!(!config.jobs[1].start);
        assert!(config.jobs[1].message.is_empty());
    }

    #[test]
    fn zero_wake_capacity_rejected() {
        let err = from_toml("[scheduler]\nwake_capacity = 0\n").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn job_without_cron_rejected() {
        assert!(from_toml("[[jobs]]\nname = \"x\"\n").is_err());
    }
}
