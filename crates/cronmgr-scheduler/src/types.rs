use std::time::Duration;

use chrono::{DateTime, Utc};
use cronmgr_machines::MachineConfig;
use serde::{Deserialize, Serialize};

use cronmgr_core::config::DEFAULT_COMMAND_TIMEOUT_SECS;

/// A recurring trigger definition.
///
/// `name` is the natural key used by schedule sync; `id` is assigned by the
/// store and referenced by jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Store-assigned; zero until persisted.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// Application the machines are launched into.
    pub app_name: String,
    /// Cron expression, copied verbatim into the crontab.
    pub schedule: String,
    #[serde(default)]
    pub region: String,
    pub command: String,
    /// Seconds; zero means the default of 30.
    #[serde(default)]
    pub command_timeout: u64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub config: MachineConfig,
}

impl Schedule {
    /// Effective command timeout in seconds.
    pub fn timeout_secs(&self) -> u64 {
        if self.command_timeout == 0 {
            DEFAULT_COMMAND_TIMEOUT_SECS
        } else {
            self.command_timeout
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs())
    }

    /// Fill defaults that are persisted rather than computed on read.
    pub fn with_defaults(mut self) -> Self {
        self.command_timeout = self.timeout_secs();
        self
    }

    /// True when both describe the same definition, ignoring the store ID.
    pub fn same_definition(&self, other: &Schedule) -> bool {
        Schedule { id: 0, ..self.clone() } == Schedule { id: 0, ..other.clone() }
    }
}

/// Lifecycle state of a job. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, machine not yet provisioned.
    Pending,
    /// Machine provisioned; result not yet known.
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            JobStatus::Pending | JobStatus::Running => false,
            JobStatus::Completed | JobStatus::Failed => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One execution attempt of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub schedule_id: i64,
    pub status: JobStatus,
    /// Set once provisioning succeeded.
    pub machine_id: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    /// Command stderr, or the failure message recorded by cron-manager.
    pub stderr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly when `status` is terminal.
    pub finished_at: Option<DateTime<Utc>>,
}
