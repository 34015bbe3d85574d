//! `tickwork-core` — configuration shared by the scheduler library and its host binary.

pub mod config;
pub mod error;

pub use config::{JobConfig, SchedulerConfig, TickworkConfig};
pub use error::{CoreError, Result};
