use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cronmgr_core::config::DEFAULT_START_TIMEOUT_SECS;
use cronmgr_core::ExecutionMode;
use cronmgr_machines::{
    ExecResult, InitConfig, LaunchRequest, Machine, MachineClient, MachineClientFactory,
    MachineState, RestartConfig, JOB_ID_KEY, MANAGED_BY_KEY, SCHEDULE_KEY,
};
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, field, info, info_span, warn, Instrument, Span};

use crate::error::{Result, SchedulerError};
use crate::store::Store;
use crate::types::{Job, JobStatus, Schedule};

/// Drives one trigger of a schedule from job creation to a recorded outcome.
///
/// In [`ExecutionMode::Exec`] the command runs through the provider's exec
/// endpoint and the outcome is known when [`JobRunner::process_job`]
/// returns. In [`ExecutionMode::Init`] the command is the machine's init
/// process and the job is left `running` for the monitor to finish.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<Store>,
    machines: Arc<dyn MachineClientFactory>,
    mode: ExecutionMode,
    start_timeout: Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<Store>,
        machines: Arc<dyn MachineClientFactory>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            store,
            machines,
            mode,
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
        }
    }

    /// How long to wait for a machine to report `started` before exec.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Trigger `schedule_id` once and return the job as last written.
    ///
    /// A missing schedule fails before any job exists. Every later failure is
    /// recorded on the job and also returned. Nothing is retried here; the
    /// next cron tick is the retry.
    pub async fn process_job(&self, schedule_id: i64) -> Result<Job> {
        let schedule = self.store.find_schedule(schedule_id)?;
        let job = self.store.create_job(schedule.id)?;

        let span = info_span!(
            "job",
            job_id = job.id,
            schedule_id = schedule.id,
            app_name = %schedule.app_name,
            machine_id = field::Empty,
        );
        self.run(&schedule, &job).instrument(span).await?;
        self.store.find_job(job.id)
    }

    /// Run [`JobRunner::process_job`] on its own task.
    ///
    /// Dropping the handle detaches the job instead of cancelling it, so a
    /// caller that goes away mid-flight cannot leave a live machine behind.
    pub fn spawn_job(&self, schedule_id: i64) -> JoinHandle<Result<Job>> {
        let runner = self.clone();
        tokio::spawn(async move { runner.process_job(schedule_id).await })
    }

    async fn run(&self, schedule: &Schedule, job: &Job) -> Result<()> {
        info!(mode = %self.mode, "processing job");

        let client = self
            .machines
            .for_app(&schedule.app_name)
            .map_err(|e| self.fail(job.id, 1, SchedulerError::Provisioning(e)))?;

        let request = launch_request(schedule, job, self.mode);
        let machine = client
            .launch(&request)
            .await
            .map_err(|e| self.fail(job.id, 1, SchedulerError::Provisioning(e)))?;
        Span::current().record("machine_id", machine.id.as_str());

        // Record the binding before anything else so a crash from here on
        // leaves a job the reconciler can tie back to this machine.
        let recorded = self
            .store
            .update_job_machine(job.id, &machine.id)
            .and_then(|()| self.store.update_job_status(job.id, JobStatus::Running));
        if let Err(e) = recorded {
            destroy_quietly(client.as_ref(), &machine.id).await;
            return Err(self.fail(job.id, 1, e));
        }

        match self.mode {
            ExecutionMode::Init => {
                info!("machine launched, completion left to the monitor");
                Ok(())
            }
            ExecutionMode::Exec => {
                let outcome = AssertUnwindSafe(self.execute(client.as_ref(), schedule, job, &machine))
                    .catch_unwind()
                    .await;
                destroy_quietly(client.as_ref(), &machine.id).await;
                match outcome {
                    Ok(result) => result,
                    Err(panic) => {
                        // Best effort; the reconciler catches it otherwise.
                        if let Err(e) = self.store.fail_job(job.id, 1, "job aborted while executing") {
                            error!(error = %e, "could not record aborted job");
                        }
                        std::panic::resume_unwind(panic)
                    }
                }
            }
        }
    }

    async fn execute(
        &self,
        client: &dyn MachineClient,
        schedule: &Schedule,
        job: &Job,
        machine: &Machine,
    ) -> Result<()> {
        client
            .wait_for_state(machine, MachineState::Started, self.start_timeout)
            .await
            .map_err(|e| self.fail(job.id, 1, SchedulerError::Execution(e)))?;

        let result = client
            .exec(&machine.id, &schedule.command, schedule.timeout())
            .await
            .map_err(|e| self.fail(job.id, 1, SchedulerError::Execution(e)))?;

        match interpret(result) {
            Ok(stdout) => {
                self.store.complete_job(job.id, 0, &stdout)?;
                info!("job completed");
                Ok(())
            }
            Err(e) => {
                let code = match &e {
                    SchedulerError::CommandFailed { exit_code, .. } => *exit_code,
                    _ => 1,
                };
                Err(self.fail(job.id, code, e))
            }
        }
    }

    /// Record `err` on the job and hand it back for propagation.
    fn fail(&self, job_id: i64, exit_code: i32, err: SchedulerError) -> SchedulerError {
        error!(exit_code, error = %err, "job failed");
        if let Err(store_err) = self.store.fail_job(job_id, exit_code, &err.to_string()) {
            error!(error = %store_err, "could not record job failure");
        }
        err
    }
}

/// Classify an exec result. Stderr output overrides a zero exit code.
pub fn interpret(result: ExecResult) -> Result<String> {
    if result.exit_code != 0 {
        return Err(SchedulerError::CommandFailed {
            exit_code: result.exit_code,
            message: format!("job failed with exit code {}", result.exit_code),
        });
    }
    if !result.stderr.is_empty() {
        return Err(SchedulerError::CommandFailed {
            exit_code: -1,
            message: result.stderr,
        });
    }
    Ok(result.stdout)
}

/// Launch definition for one job of `schedule`.
///
/// Always tags the machine so the reconciler can find it again. In init mode
/// the command becomes the init process and the machine cleans itself up.
pub fn launch_request(schedule: &Schedule, job: &Job, mode: ExecutionMode) -> LaunchRequest {
    let mut config = schedule.config.clone();
    config
        .metadata
        .insert(MANAGED_BY_KEY.to_string(), "true".to_string());
    config
        .metadata
        .insert(JOB_ID_KEY.to_string(), job.id.to_string());
    config
        .metadata
        .insert(SCHEDULE_KEY.to_string(), schedule.name.clone());

    if mode == ExecutionMode::Init {
        config.init = Some(InitConfig {
            cmd: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                schedule.command.clone(),
            ],
        });
        config.auto_destroy = true;
        config.restart.get_or_insert_with(|| RestartConfig {
            max_retries: 0,
            policy: "no".to_string(),
        });
    }

    LaunchRequest {
        name: Some(format!("{}-{}", schedule.name, job.id)),
        region: schedule.region.clone(),
        config,
    }
}

async fn destroy_quietly(client: &dyn MachineClient, machine_id: &str) {
    if let Err(e) = client.destroy(machine_id).await {
        warn!(%machine_id, error = %e, "failed to destroy machine");
    }
}
