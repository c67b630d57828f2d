//! Startup repair of jobs and machines left behind by an unclean shutdown.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cronmgr_core::ExecutionMode;
use cronmgr_machines::{Machine, MachineClient, MachineClientFactory, MachineState};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::Result;
use crate::store::Store;
use crate::types::{Job, JobStatus, Schedule};

/// Recorded on every job the reconciler gives up on.
pub const INTERRUPTED_MESSAGE: &str = "job was interrupted on shutdown";

/// What one reconciliation run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Managed, live machines examined in the machine-first pass.
    pub machines_checked: usize,
    pub machines_destroyed: usize,
    /// Managed machines with no job pointing at them.
    pub orphaned_machines: usize,
    pub jobs_failed: usize,
}

/// One-shot pass run before the monitor and the API start.
pub struct Reconciler {
    store: Arc<Store>,
    machines: Arc<dyn MachineClientFactory>,
    mode: ExecutionMode,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        machines: Arc<dyn MachineClientFactory>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            store,
            machines,
            mode,
        }
    }

    /// Run the machine-first pass, then the job-first pass.
    ///
    /// Provider errors are logged and skipped; storage errors abort the run.
    pub async fn run(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.reconcile_machines(&mut report).await?;
        self.reconcile_jobs(&mut report).await?;
        info!(
            machines_checked = report.machines_checked,
            machines_destroyed = report.machines_destroyed,
            orphaned_machines = report.orphaned_machines,
            jobs_failed = report.jobs_failed,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_machines(&self, report: &mut ReconcileReport) -> Result<()> {
        let apps: BTreeSet<String> = self
            .store
            .list_schedules()?
            .into_iter()
            .map(|s| s.app_name)
            .collect();

        for app in apps {
            let client = match self.machines.for_app(&app) {
                Ok(client) => client,
                Err(e) => {
                    warn!(app_name = %app, error = %e, "no machine client for app");
                    continue;
                }
            };
            let machines = match client.list().await {
                Ok(machines) => machines,
                Err(e) => {
                    warn!(app_name = %app, error = %e, "failed to list machines");
                    continue;
                }
            };

            for machine in machines
                .iter()
                .filter(|m| m.is_managed() && m.state != MachineState::Destroyed)
            {
                report.machines_checked += 1;
                self.reconcile_machine(client.as_ref(), machine, report)
                    .await?;
            }
        }
        Ok(())
    }

    async fn reconcile_machine(
        &self,
        client: &dyn MachineClient,
        machine: &Machine,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let machine_id = machine.id.as_str();
        let Some(job) = self.store.find_job_by_machine_id(machine_id)? else {
            warn!(app_name = %client.app_name(), %machine_id, "managed machine has no job, leaving it alone");
            report.orphaned_machines += 1;
            return Ok(());
        };
        let span = info_span!("reconcile", job_id = job.id, %machine_id);
        self.settle_machine(client, machine, &job, report)
            .instrument(span)
            .await
    }

    async fn settle_machine(
        &self,
        client: &dyn MachineClient,
        machine: &Machine,
        job: &Job,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let machine_id = machine.id.as_str();
        match job.status {
            JobStatus::Running => {
                let schedule = self.store.find_schedule(job.schedule_id)?;
                let started = machine.state == MachineState::Started;
                if started && !overdue(job, &schedule, Utc::now()) {
                    return Ok(());
                }
                match client.destroy(machine_id).await {
                    Ok(()) => report.machines_destroyed += 1,
                    Err(e) if started => {
                        warn!(error = %e, "could not stop overdue machine, leaving job for a later run");
                        return Ok(());
                    }
                    Err(e) => warn!(state = %machine.state, error = %e, "could not destroy stalled machine"),
                }
                self.interrupt(job, report)
            }
            JobStatus::Completed | JobStatus::Failed => {
                info!(status = %job.status, "destroying machine leaked by a finished job");
                match client.destroy(machine_id).await {
                    Ok(()) => report.machines_destroyed += 1,
                    Err(e) => warn!(error = %e, "could not destroy leaked machine"),
                }
                Ok(())
            }
            // Never ran; the job-first pass fails it.
            JobStatus::Pending => Ok(()),
        }
    }

    async fn reconcile_jobs(&self, report: &mut ReconcileReport) -> Result<()> {
        for job in self.store.list_reconcilable_jobs()? {
            let span = info_span!("reconcile", job_id = job.id, schedule_id = job.schedule_id);
            self.reconcile_job(&job, report).instrument(span).await?;
        }
        Ok(())
    }

    async fn reconcile_job(&self, job: &Job, report: &mut ReconcileReport) -> Result<()> {
        match job.status {
            JobStatus::Pending => {
                if let Some(machine_id) = job.machine_id.as_deref() {
                    if self.destroy_for(job, machine_id).await {
                        report.machines_destroyed += 1;
                    }
                }
                self.interrupt(job, report)
            }
            JobStatus::Running => self.reconcile_running(job, report).await,
            JobStatus::Completed | JobStatus::Failed => Ok(()),
        }
    }

    async fn reconcile_running(&self, job: &Job, report: &mut ReconcileReport) -> Result<()> {
        let Some(machine_id) = job.machine_id.as_deref() else {
            warn!("running job was never bound to a machine");
            return self.interrupt(job, report);
        };
        let schedule = self.store.find_schedule(job.schedule_id)?;
        let client = match self.machines.for_app(&schedule.app_name) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "no machine client for job");
                return Ok(());
            }
        };

        let machine = match client.get(machine_id).await {
            Ok(machine) => machine,
            Err(e) if e.is_not_found() => {
                warn!(%machine_id, "machine no longer exists");
                return self.interrupt(job, report);
            }
            Err(e) => {
                warn!(%machine_id, error = %e, "could not look up machine, leaving job for the monitor");
                return Ok(());
            }
        };

        if machine.state == MachineState::Destroyed {
            return match self.mode {
                ExecutionMode::Exec => self.interrupt(job, report),
                ExecutionMode::Init => {
                    debug!(%machine_id, "machine finished, monitor will read its exit event");
                    Ok(())
                }
            };
        }

        if overdue(job, &schedule, Utc::now()) {
            match client.destroy(machine_id).await {
                Ok(()) => {
                    report.machines_destroyed += 1;
                    return self.interrupt(job, report);
                }
                Err(e) => warn!(%machine_id, error = %e, "could not destroy overdue machine"),
            }
        }
        Ok(())
    }

    /// Best-effort destroy of the machine bound to `job`.
    async fn destroy_for(&self, job: &Job, machine_id: &str) -> bool {
        let client = self
            .store
            .find_schedule(job.schedule_id)
            .map_err(|e| e.to_string())
            .and_then(|s| self.machines.for_app(&s.app_name).map_err(|e| e.to_string()));
        let result = match client {
            Ok(client) => client.destroy(machine_id).await.map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(%machine_id, error = %e, "could not destroy machine of pending job");
                false
            }
        }
    }

    fn interrupt(&self, job: &Job, report: &mut ReconcileReport) -> Result<()> {
        self.store.fail_job(job.id, -1, INTERRUPTED_MESSAGE)?;
        report.jobs_failed += 1;
        warn!(job_id = job.id, status = %job.status, "job marked interrupted");
        Ok(())
    }
}

/// Time since the job last changed exceeds its command timeout.
fn overdue(job: &Job, schedule: &Schedule, now: DateTime<Utc>) -> bool {
    (now - job.updated_at).num_seconds() > schedule.timeout_secs() as i64
}
