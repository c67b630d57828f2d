//! `cm` command tree.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cronmgr_core::CronManagerConfig;
use cronmgr_machines::MachineConfig;
use cronmgr_scheduler::{
    sync_crontab, sync_schedules_from_file, Job, Schedule, Store, SystemCrontab,
};
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::runtime;

#[derive(Parser, Debug)]
#[command(name = "cm")]
#[command(version)]
#[command(about = "Runs scheduled commands on short-lived machines")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: $CRON_MANAGER_CONFIG or /data/cron-manager.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sync schedules and crontab, reconcile, then run the monitor and API
    Start,

    /// Run only the monitor loop
    Monitor,

    /// Run only the HTTP API
    Api,

    /// Repair jobs and machines left behind by an unclean shutdown
    Reconcile,

    /// Schedule management
    Schedules {
        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Job inspection and triggering
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommands {
    /// List all schedules
    List,

    /// Create a schedule
    Create {
        name: String,
        #[arg(long)]
        app: String,
        /// Cron expression, e.g. "*/5 * * * *"
        #[arg(long)]
        schedule: String,
        #[arg(long)]
        command: String,
        #[arg(long)]
        image: String,
        #[arg(long, default_value = "")]
        region: String,
        /// Command timeout in seconds
        #[arg(long, default_value_t = 0)]
        timeout: u64,
        #[arg(long)]
        enabled: bool,
    },

    /// Delete a schedule and its job history
    Delete { name: String },

    /// Sync schedules from the schedule file, then rebuild the crontab
    Sync {
        /// Schedule file (default: schedules.path from config)
        #[arg(long)]
        file: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// List recent jobs of a schedule
    List {
        schedule_id: i64,
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },

    /// Show one job in full
    Show { job_id: i64 },

    /// Run a schedule once, now
    Trigger { schedule_id: i64 },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CronManagerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start => start(config).await,
        Commands::Monitor => {
            let store = runtime::open_store(&config)?;
            let machines = runtime::machine_factory(&config)?;
            let (_tx, rx) = runtime::shutdown_channel();
            runtime::monitor(&config, store, machines).run(rx).await?;
            Ok(())
        }
        Commands::Api => {
            let store = runtime::open_store(&config)?;
            let machines = runtime::machine_factory(&config)?;
            let runner = runtime::job_runner(&config, store.clone(), machines);
            let (_tx, rx) = runtime::shutdown_channel();
            let state = Arc::new(AppState::new(config, store, runner, Arc::new(SystemCrontab)));
            runtime::serve(state, rx).await
        }
        Commands::Reconcile => {
            let store = runtime::open_store(&config)?;
            let machines = runtime::machine_factory(&config)?;
            let report = runtime::reconciler(&config, store, machines).run().await?;
            println!(
                "checked {} machines, destroyed {}, orphaned {}, failed {} jobs",
                report.machines_checked,
                report.machines_destroyed,
                report.orphaned_machines,
                report.jobs_failed
            );
            Ok(())
        }
        Commands::Schedules { command } => schedules(&config, command),
        Commands::Jobs { command } => jobs(&config, command).await,
    }
}

async fn start(config: CronManagerConfig) -> anyhow::Result<()> {
    let machines = runtime::machine_factory(&config)?;
    let store = runtime::open_store(&config)?;

    match sync_schedules_from_file(&store, &config.schedules.path) {
        Ok(_) => {
            if let Err(e) = sync_crontab(
                &store,
                &config.crontab.path,
                &config.crontab.executable,
                &SystemCrontab,
            ) {
                warn!(error = %e, "failed to sync crontab");
            }
        }
        Err(e) => warn!(error = %e, "problem syncing schedules"),
    }

    runtime::reconciler(&config, store.clone(), machines.clone())
        .run()
        .await
        .context("reconciliation failed")?;

    let (shutdown_tx, shutdown_rx) = runtime::shutdown_channel();

    let monitor = runtime::monitor(&config, store.clone(), machines.clone());
    let monitor_rx = shutdown_rx.clone();
    let monitor_tx = shutdown_tx.clone();
    let monitor_task = tokio::spawn(async move {
        let result = monitor.run(monitor_rx).await;
        if let Err(e) = &result {
            error!(error = %e, "monitor stopped");
            // Take the API down with it so the supervisor restarts both.
            let _ = monitor_tx.send(true);
        }
        result
    });

    let runner = runtime::job_runner(&config, store.clone(), machines);
    let state = Arc::new(AppState::new(config, store, runner, Arc::new(SystemCrontab)));
    let served = runtime::serve(state, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    monitor_task.await.context("monitor task panicked")??;
    served
}

fn schedules(config: &CronManagerConfig, command: ScheduleCommands) -> anyhow::Result<()> {
    let store = runtime::open_store(config)?;
    match command {
        ScheduleCommands::List => {
            print_schedules(&store.list_schedules()?);
        }
        ScheduleCommands::Create {
            name,
            app,
            schedule,
            command,
            image,
            region,
            timeout,
            enabled,
        } => {
            let created = store.create_schedule(
                &Schedule {
                    id: 0,
                    name,
                    app_name: app,
                    schedule,
                    region,
                    command,
                    command_timeout: timeout,
                    enabled,
                    config: MachineConfig {
                        image,
                        ..MachineConfig::default()
                    },
                }
                .with_defaults(),
            )?;
            println!("created schedule {} ({})", created.id, created.name);
            refresh_crontab(config, &store);
        }
        ScheduleCommands::Delete { name } => {
            store.delete_schedule_by_name(&name)?;
            println!("deleted schedule {name}");
            refresh_crontab(config, &store);
        }
        ScheduleCommands::Sync { file } => {
            let path = file.unwrap_or_else(|| config.schedules.path.clone());
            let report = sync_schedules_from_file(&store, &path)?;
            println!(
                "created {}, updated {}, unchanged {}, deleted {}",
                report.created, report.updated, report.unchanged, report.deleted
            );
            let entries = sync_crontab(
                &store,
                &config.crontab.path,
                &config.crontab.executable,
                &SystemCrontab,
            )?;
            println!("installed {entries} crontab entries");
        }
    }
    Ok(())
}

fn refresh_crontab(config: &CronManagerConfig, store: &Store) {
    if let Err(e) = sync_crontab(
        store,
        &config.crontab.path,
        &config.crontab.executable,
        &SystemCrontab,
    ) {
        warn!(error = %e, "failed to refresh crontab");
    }
}

async fn jobs(config: &CronManagerConfig, command: JobCommands) -> anyhow::Result<()> {
    let store = runtime::open_store(config)?;
    match command {
        JobCommands::List { schedule_id, limit } => {
            let schedule = store.find_schedule(schedule_id)?;
            print_jobs(&store.list_jobs(schedule.id, limit)?);
        }
        JobCommands::Show { job_id } => {
            print_job(&store.find_job(job_id)?);
        }
        JobCommands::Trigger { schedule_id } => {
            let machines = runtime::machine_factory(config)?;
            let job = runtime::job_runner(config, store, machines)
                .process_job(schedule_id)
                .await?;
            info!(job_id = job.id, status = %job.status, "job processed");
            println!("job {} {}", job.id, job.status);
        }
    }
    Ok(())
}

pub fn print_schedules(schedules: &[Schedule]) {
    println!(
        "{:<6} {:<24} {:<20} {:<16} {:<8} {:<8} COMMAND",
        "ID", "NAME", "APP", "SCHEDULE", "REGION", "ENABLED"
    );
    for s in schedules {
        println!(
            "{:<6} {:<24} {:<20} {:<16} {:<8} {:<8} {}",
            s.id, s.name, s.app_name, s.schedule, s.region, s.enabled, s.command
        );
    }
}

pub fn print_jobs(jobs: &[Job]) {
    println!(
        "{:<8} {:<10} {:<16} {:<6} {:<20} FINISHED",
        "ID", "STATUS", "MACHINE", "EXIT", "CREATED"
    );
    for job in jobs {
        println!(
            "{:<8} {:<10} {:<16} {:<6} {:<20} {}",
            job.id,
            job.status,
            job.machine_id.as_deref().unwrap_or("-"),
            job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
}

pub fn print_job(job: &Job) {
    println!("ID:          {}", job.id);
    println!("Schedule:    {}", job.schedule_id);
    println!("Status:      {}", job.status);
    println!("Machine:     {}", job.machine_id.as_deref().unwrap_or("-"));
    println!(
        "Exit code:   {}",
        job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
    );
    println!("Created:     {}", job.created_at.to_rfc3339());
    println!("Updated:     {}", job.updated_at.to_rfc3339());
    println!(
        "Finished:    {}",
        job.finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into())
    );
    println!("\nstdout:\n{}", job.stdout.as_deref().unwrap_or(""));
    println!("\nstderr:\n{}", job.stderr.as_deref().unwrap_or(""));
}
