use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cronmgr_core::config::{DEFAULT_MONITOR_CONCURRENCY, DEFAULT_MONITOR_INTERVAL_SECS};
use cronmgr_machines::{MachineClientFactory, MachineState};
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::Result;
use crate::store::Store;
use crate::types::{Job, JobStatus};

/// Recorded when the provider no longer knows the machine.
pub const MACHINE_GONE_MESSAGE: &str = "machine destroyed before we could interpret the results";

/// Polls running jobs until their machines finish or overrun.
pub struct Monitor {
    store: Arc<Store>,
    machines: Arc<dyn MachineClientFactory>,
    interval: Duration,
    max_concurrency: usize,
}

impl Monitor {
    pub fn new(store: Arc<Store>, machines: Arc<dyn MachineClientFactory>) -> Self {
        Self {
            store,
            machines,
            interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            max_concurrency: DEFAULT_MONITOR_CONCURRENCY,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Tick until `shutdown` flips to `true` or its sender goes away.
    ///
    /// A storage error while listing jobs ends the loop with that error; the
    /// supervisor restarts the process.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            max_concurrency = self.max_concurrency,
            "monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("monitor shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluate every running job once. Returns how many were examined.
    ///
    /// Evaluations fan out up to `max_concurrency`; the call returns only
    /// after all of them finished, so ticks never overlap.
    pub async fn tick(&self) -> Result<usize> {
        let jobs = self.store.list_jobs_by_status(JobStatus::Running)?;
        let count = jobs.len();
        if count == 0 {
            return Ok(0);
        }
        debug!(count, "checking running jobs");

        stream::iter(jobs)
            .for_each_concurrent(self.max_concurrency, |job| async move {
                let span = info_span!("monitor", job_id = job.id, schedule_id = job.schedule_id);
                if let Err(e) = self.check(&job).instrument(span).await {
                    warn!(job_id = job.id, error = %e, "failed to check job");
                }
            })
            .await;
        Ok(count)
    }

    async fn check(&self, job: &Job) -> Result<()> {
        let Some(machine_id) = job.machine_id.as_deref() else {
            debug!("job has no machine yet");
            return Ok(());
        };
        let schedule = self.store.find_schedule(job.schedule_id)?;
        let client = self.machines.for_app(&schedule.app_name)?;

        let machine = match client.get(machine_id).await {
            Ok(machine) => machine,
            Err(e) if e.is_not_found() => {
                warn!(%machine_id, "machine no longer known to the provider");
                return self.fail(job.id, -1, MACHINE_GONE_MESSAGE);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            %machine_id,
            state = %machine.state,
            execution_secs = machine.execution_secs(Utc::now()),
            "evaluating machine"
        );

        if machine.state == MachineState::Destroyed {
            return match machine.exit_code() {
                Some(0) => self.complete(job.id),
                Some(code) => self.fail(job.id, code, ""),
                None => {
                    error!(%machine_id, "destroyed machine has no exit event");
                    Ok(())
                }
            };
        }

        let started = machine.started_at().unwrap_or(job.updated_at);
        let elapsed = (Utc::now() - started).num_seconds();
        let timeout = schedule.timeout_secs();
        if elapsed > timeout as i64 {
            warn!(%machine_id, elapsed, timeout, "job exceeded its command timeout");
            client.destroy(machine_id).await?;
            let message =
                format!("machine `{machine_id}` exceeded the command timeout of {timeout} seconds.");
            return self.fail(job.id, -1, &message);
        }
        Ok(())
    }

    /// False once another writer already finished the job (or it was deleted).
    fn still_running(&self, job_id: i64) -> Result<bool> {
        match self.store.find_job(job_id) {
            Ok(job) => Ok(!job.status.is_terminal()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn complete(&self, job_id: i64) -> Result<()> {
        if !self.still_running(job_id)? {
            return Ok(());
        }
        self.store.complete_job(job_id, 0, "")?;
        info!("job completed");
        Ok(())
    }

    fn fail(&self, job_id: i64, exit_code: i32, message: &str) -> Result<()> {
        if !self.still_running(job_id)? {
            debug!("job already finished, skipping");
            return Ok(());
        }
        self.store.fail_job(job_id, exit_code, message)?;
        warn!(exit_code, "job failed");
        Ok(())
    }
}
