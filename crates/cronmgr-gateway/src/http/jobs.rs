use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use cronmgr_scheduler::Job;
use serde::Deserialize;
use tracing::{error, info};

use super::{api_error, scheduler_error, ApiError};
use crate::app::AppState;

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// POST /command/jobs/trigger: run one job for schedule `{"id": N}`.
///
/// Empty 200 once the job has been processed; any failure, including a
/// malformed body, is a 500 with `{"error": "..."}`.
pub async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let req: TriggerRequest = serde_json::from_slice(&body).map_err(|e| {
        error!(error = %e, "failed to decode trigger request");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
    })?;

    // The job runs on its own task so a client that disconnects mid-flight
    // cannot cancel it between launch and cleanup.
    match state.runner.spawn_job(req.id).await {
        Ok(Ok(job)) => {
            info!(schedule_id = req.id, job_id = job.id, status = %job.status, "job processed");
            Ok(StatusCode::OK)
        }
        Ok(Err(e)) => {
            error!(schedule_id = req.id, error = %e, "failed to process job");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
        Err(e) => {
            error!(schedule_id = req.id, error = %e, "job task aborted");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// GET /command/jobs/{id}
pub async fn show_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, ApiError> {
    state
        .store
        .find_job(id)
        .map(Json)
        .map_err(|e| scheduler_error(&e))
}

/// GET /command/schedules/{id}/jobs?limit=N: most recent first.
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let store = &state.store;
    store
        .find_schedule(schedule_id)
        .and_then(|s| store.list_jobs(s.id, params.limit.unwrap_or(DEFAULT_LIST_LIMIT)))
        .map(Json)
        .map_err(|e| scheduler_error(&e))
}
