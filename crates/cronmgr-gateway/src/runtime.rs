//! Process bootstrap shared by `cm` and `process-job`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cronmgr_core::config::DB_BUSY_TIMEOUT_MS;
use cronmgr_core::CronManagerConfig;
use cronmgr_machines::{FlyClientFactory, MachineClientFactory};
use cronmgr_scheduler::{JobRunner, Monitor, Reconciler, Store};
use tokio::sync::watch;
use tracing::info;

use crate::app::{self, AppState};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cronmgr_gateway=info,cronmgr_scheduler=info,cronmgr_machines=info,tower_http=debug"
                    .into()
            }),
        )
        .init();
}

pub fn open_store(config: &CronManagerConfig) -> anyhow::Result<Arc<Store>> {
    let path = &config.database.path;
    info!(%path, "opening state database");
    let store = Store::open(path, Duration::from_millis(DB_BUSY_TIMEOUT_MS))
        .with_context(|| format!("failed to open database at {path}"))?;
    Ok(Arc::new(store))
}

/// Machines API client factory. Fails without a provider credential.
pub fn machine_factory(config: &CronManagerConfig) -> anyhow::Result<Arc<dyn MachineClientFactory>> {
    let token = config.machines.require_api_token()?;
    Ok(Arc::new(FlyClientFactory::new(
        token,
        Some(config.machines.api_base_url.clone()),
    )))
}

pub fn job_runner(
    config: &CronManagerConfig,
    store: Arc<Store>,
    machines: Arc<dyn MachineClientFactory>,
) -> JobRunner {
    JobRunner::new(store, machines, config.machines.execution_mode)
        .with_start_timeout(Duration::from_secs(config.machines.start_timeout_secs))
}

pub fn monitor(
    config: &CronManagerConfig,
    store: Arc<Store>,
    machines: Arc<dyn MachineClientFactory>,
) -> Monitor {
    Monitor::new(store, machines)
        .with_interval(Duration::from_secs(config.monitor.interval_secs))
        .with_max_concurrency(config.monitor.max_concurrency)
}

pub fn reconciler(
    config: &CronManagerConfig,
    store: Arc<Store>,
    machines: Arc<dyn MachineClientFactory>,
) -> Reconciler {
    Reconciler::new(store, machines, config.machines.execution_mode)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

/// Shutdown channel flipped to `true` by the first SIGINT/SIGTERM.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });
    (tx, rx)
}

/// Serve the HTTP API until `shutdown` flips, then drain in-flight requests.
pub async fn serve(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.api.bind, state.config.api.port)
        .parse()
        .context("invalid api bind address")?;
    let router = app::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("cron-manager api listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!("api stopped");
    Ok(())
}
