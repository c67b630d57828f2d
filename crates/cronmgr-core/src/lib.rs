//! `cronmgr-core`: configuration and errors shared by every cron-manager role.

pub mod config;
pub mod error;

pub use config::{CronManagerConfig, ExecutionMode};
pub use error::{CoreError, Result};
