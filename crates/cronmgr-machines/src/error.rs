use thiserror::Error;

use crate::types::MachineState;

/// Errors returned by a [`crate::MachineClient`].
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The machine does not exist or has aged out of the query window.
    #[error("machine not found: {machine_id}")]
    NotFound { machine_id: String },

    #[error("machine {machine_id} did not reach state {state} within {secs}s")]
    Timeout {
        machine_id: String,
        state: MachineState,
        secs: u64,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl MachineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MachineError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, MachineError>;
