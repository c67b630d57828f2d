//! Crontab entry point: `process-job <schedule_id>`.
//!
//! Runs one job to completion (or launch, in init mode) and exits 0, or
//! prints the error and exits 1.

use std::process::ExitCode;

use cronmgr_core::CronManagerConfig;
use cronmgr_gateway::runtime;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    runtime::init_tracing();

    let Some(schedule_id) = std::env::args().nth(1).and_then(|a| a.parse::<i64>().ok()) else {
        eprintln!("usage: process-job <schedule_id>");
        return ExitCode::FAILURE;
    };

    match run(schedule_id).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(schedule_id, error = %e, "job processing failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(schedule_id: i64) -> anyhow::Result<()> {
    let config = CronManagerConfig::load(None)?;
    let machines = runtime::machine_factory(&config)?;
    let store = runtime::open_store(&config)?;
    runtime::job_runner(&config, store, machines)
        .process_job(schedule_id)
        .await?;
    Ok(())
}
