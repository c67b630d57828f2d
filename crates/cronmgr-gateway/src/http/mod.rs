pub mod health;
pub mod jobs;
pub mod schedules;

use axum::{http::StatusCode, Json};
use cronmgr_scheduler::SchedulerError;
use serde_json::{json, Value};

/// Error half of every handler result: a status and `{"error": "..."}`.
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

/// 404 for missing rows, 500 for everything else.
pub fn scheduler_error(err: &SchedulerError) -> ApiError {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    api_error(status, err)
}
