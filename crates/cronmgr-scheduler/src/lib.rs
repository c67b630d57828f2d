//! `cronmgr-scheduler`: job orchestration over SQLite and remote machines.
//!
//! # Overview
//!
//! Schedules are synced from a declarative file into the [`store::Store`] and
//! rendered into the system crontab. Each cron tick runs `process-job <id>`,
//! which drives a [`engine::JobRunner`] through one job. The
//! [`monitor::Monitor`] polls running jobs, and the [`reconcile::Reconciler`]
//! repairs whatever an unclean shutdown left behind.
//!
//! # Job lifecycle
//!
//! | Status      | Set by                       | Terminal |
//! |-------------|------------------------------|----------|
//! | `pending`   | engine, on trigger           | no       |
//! | `running`   | engine, once a machine exists| no       |
//! | `completed` | engine or monitor            | yes      |
//! | `failed`    | engine, monitor, reconciler  | yes      |

pub mod crontab;
pub mod db;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use crontab::{sync_crontab, CrontabInstaller, SystemCrontab};
pub use engine::JobRunner;
pub use error::{Result, SchedulerError};
pub use monitor::Monitor;
pub use reconcile::{ReconcileReport, Reconciler};
pub use store::Store;
pub use sync::{sync_schedules, sync_schedules_from_file, SyncReport};
pub use types::{Job, JobStatus, Schedule};
