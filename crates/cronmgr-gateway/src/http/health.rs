use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::process::Command;
use tracing::warn;

use crate::app::AppState;

const CRON_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// GET /health: liveness probe, returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("CRON_MANAGER_GIT_SHA"),
        "execution_mode": state.config.machines.execution_mode.to_string(),
    }))
}

/// GET /flycheck/cron: passes while the cron daemon reports itself running.
pub async fn cron_check_handler() -> (StatusCode, String) {
    match check_cron().await {
        Ok(output) => (StatusCode::OK, format!("[✓] cron: {output}")),
        Err(reason) => {
            warn!(%reason, "cron health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("[✗] cron: {reason}"),
            )
        }
    }
}

async fn check_cron() -> Result<String, String> {
    let run = Command::new("service").args(["cron", "status"]).output();
    let output = tokio::time::timeout(CRON_CHECK_TIMEOUT, run)
        .await
        .map_err(|_| "timed out running `service cron status`".to_string())?
        .map_err(|e| format!("failed to run `service cron status`: {e}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        Ok(stdout)
    } else if stdout.is_empty() {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    } else {
        Err(stdout)
    }
}
