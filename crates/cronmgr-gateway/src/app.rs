use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use cronmgr_core::CronManagerConfig;
use cronmgr_scheduler::{CrontabInstaller, JobRunner, Store};

use crate::http::{health, jobs, schedules};

/// Shared state passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: CronManagerConfig,
    pub store: Arc<Store>,
    pub runner: JobRunner,
    /// Used to refresh the crontab after schedule changes.
    pub crontab: Arc<dyn CrontabInstaller>,
}

impl AppState {
    pub fn new(
        config: CronManagerConfig,
        store: Arc<Store>,
        runner: JobRunner,
        crontab: Arc<dyn CrontabInstaller>,
    ) -> Self {
        Self {
            config,
            store,
            runner,
            crontab,
        }
    }
}

/// Assemble the full Axum router.
///
/// Both `/command/schedules/{schedule}` routes share a parameter name; the
/// delete route reads it as a name, the jobs route as an ID.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/flycheck/cron", get(health::cron_check_handler))
        .route("/command/jobs/trigger", post(jobs::trigger_handler))
        .route("/command/jobs/{id}", get(jobs::show_handler))
        .route(
            "/command/schedules",
            get(schedules::list_handler).post(schedules::create_handler),
        )
        .route(
            "/command/schedules/{schedule}",
            delete(schedules::delete_handler),
        )
        .route("/command/schedules/{schedule}/jobs", get(jobs::list_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
