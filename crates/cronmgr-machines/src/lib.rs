//! `cronmgr-machines`: the remote compute contract cron-manager drives.
//!
//! The orchestration core only ever sees [`MachineClient`]; [`fly`] provides
//! the production implementation over the Machines REST API.

pub mod client;
pub mod error;
pub mod fly;
pub mod types;

pub use client::{MachineClient, MachineClientFactory};
pub use error::{MachineError, Result};
pub use fly::FlyClientFactory;
pub use types::{
    ExecResult, GuestConfig, InitConfig, LaunchRequest, Machine, MachineConfig, MachineEvent,
    MachineState, RestartConfig, JOB_ID_KEY, MANAGED_BY_KEY, SCHEDULE_KEY,
};
