use cronmgr_machines::MachineError;
use thiserror::Error;

/// Errors that can occur within the orchestration core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No schedule or job matches the given key.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// The provided schedule definition is invalid.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Launching the machine (or recording it) failed.
    #[error("failed to provision machine: {0}")]
    Provisioning(#[source] MachineError),

    /// The machine never became ready or the exec call itself failed.
    #[error("failed to execute job: {0}")]
    Execution(#[source] MachineError),

    /// The command ran and reported failure.
    #[error("{message}")]
    CommandFailed { exit_code: i32, message: String },

    #[error("Machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `crontab` rejected the generated file.
    #[error("failed to sync crontab: {reason}{}", output_suffix(.output))]
    Crontab { reason: String, output: String },
}

fn output_suffix(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!(": {output}")
    }
}

impl SchedulerError {
    pub fn schedule_not_found(key: impl ToString) -> Self {
        SchedulerError::NotFound {
            kind: "schedule",
            key: key.to_string(),
        }
    }

    pub fn job_not_found(key: impl ToString) -> Self {
        SchedulerError::NotFound {
            kind: "job",
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
