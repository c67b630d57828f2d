use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use cronmgr_scheduler::{sync_crontab, Schedule};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{api_error, scheduler_error, ApiError};
use crate::app::AppState;

/// GET /command/schedules
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Schedule>>, ApiError> {
    state
        .store
        .list_schedules()
        .map(Json)
        .map_err(|e| scheduler_error(&e))
}

/// POST /command/schedules: create a schedule from its full definition.
pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Json(schedule): Json<Schedule>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    if schedule.name.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "name is required"));
    }
    match state.store.find_schedule_by_name(&schedule.name) {
        Ok(_) => {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("schedule {} already exists", schedule.name),
            ))
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(scheduler_error(&e)),
    }

    let created = state
        .store
        .create_schedule(&schedule.with_defaults())
        .map_err(|e| scheduler_error(&e))?;
    refresh_crontab(&state).await;
    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE /command/schedules/{name}: removes the schedule and its jobs.
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .delete_schedule_by_name(&name)
        .map_err(|e| scheduler_error(&e))?;
    refresh_crontab(&state).await;
    Ok(Json(json!({ "deleted": name })))
}

/// Regenerate the crontab so the change takes effect on the next minute.
/// A failure is logged; the schedule change itself already succeeded.
async fn refresh_crontab(state: &Arc<AppState>) {
    let state = Arc::clone(state);
    let result = tokio::task::spawn_blocking(move || {
        sync_crontab(
            &state.store,
            &state.config.crontab.path,
            &state.config.crontab.executable,
            state.crontab.as_ref(),
        )
    })
    .await;

    match result {
        Ok(Ok(entries)) => info!(entries, "crontab refreshed"),
        Ok(Err(e)) => warn!(error = %e, "failed to refresh crontab"),
        Err(e) => warn!(error = %e, "crontab refresh task failed"),
    }
}
