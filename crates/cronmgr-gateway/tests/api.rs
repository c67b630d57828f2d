use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use cronmgr_core::{CronManagerConfig, ExecutionMode};
use cronmgr_gateway::app::{build_router, AppState};
use cronmgr_machines::{
    ExecResult, LaunchRequest, Machine, MachineClient, MachineClientFactory, MachineConfig,
    MachineError, MachineState,
};
use cronmgr_scheduler::{CrontabInstaller, JobRunner, JobStatus, Schedule, Store};
use rusqlite::Connection;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;

/// Provider that is never reachable.
struct Offline;

impl MachineClientFactory for Offline {
    fn for_app(&self, app_name: &str) -> cronmgr_machines::Result<Arc<dyn MachineClient>> {
        Err(MachineError::Unavailable(format!("no route to {app_name}")))
    }
}

/// Provider whose exec only returns once `release` is notified.
#[derive(Clone, Default)]
struct SlowExec {
    release: Arc<Notify>,
    destroyed: Arc<Mutex<Vec<String>>>,
}

impl MachineClientFactory for SlowExec {
    fn for_app(&self, _app_name: &str) -> cronmgr_machines::Result<Arc<dyn MachineClient>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl MachineClient for SlowExec {
    fn app_name(&self) -> &str {
        "reports"
    }

    async fn launch(&self, req: &LaunchRequest) -> cronmgr_machines::Result<Machine> {
        Ok(Machine {
            id: "m-slow".into(),
            name: req.name.clone().unwrap_or_default(),
            state: MachineState::Created,
            region: req.region.clone(),
            config: Some(req.config.clone()),
            events: vec![],
        })
    }

    async fn wait_for_state(
        &self,
        _machine: &Machine,
        _target: MachineState,
        _timeout: Duration,
    ) -> cronmgr_machines::Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        _machine_id: &str,
        _command: &str,
        _timeout: Duration,
    ) -> cronmgr_machines::Result<ExecResult> {
        self.release.notified().await;
        Ok(ExecResult {
            exit_code: 0,
            stdout: "report sent".into(),
            stderr: String::new(),
        })
    }

    async fn get(&self, machine_id: &str) -> cronmgr_machines::Result<Machine> {
        Err(MachineError::NotFound {
            machine_id: machine_id.to_string(),
        })
    }

    async fn destroy(&self, machine_id: &str) -> cronmgr_machines::Result<()> {
        self.destroyed.lock().unwrap().push(machine_id.to_string());
        Ok(())
    }

    async fn list(&self) -> cronmgr_machines::Result<Vec<Machine>> {
        Ok(vec![])
    }
}

#[derive(Default)]
struct RecordingCrontab {
    installed: Mutex<Vec<String>>,
}

impl CrontabInstaller for RecordingCrontab {
    fn install(&self, path: &Path) -> cronmgr_scheduler::Result<()> {
        let contents = std::fs::read_to_string(path)?;
        self.installed.lock().unwrap().push(contents);
        Ok(())
    }
}

struct Harness {
    router: Router,
    store: Arc<Store>,
    crontab: Arc<RecordingCrontab>,
    _dir: TempDir,
}

fn harness() -> Harness {
    harness_with(Arc::new(Offline))
}

fn harness_with(machines: Arc<dyn MachineClientFactory>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = CronManagerConfig::default();
    config.crontab.path = path_str(dir.path().join("crontab"));
    config.machines.execution_mode = ExecutionMode::Exec;

    let store = Arc::new(Store::new(Connection::open_in_memory().unwrap()).unwrap());
    let runner = JobRunner::new(store.clone(), machines, ExecutionMode::Exec);
    let crontab = Arc::new(RecordingCrontab::default());
    let state = Arc::new(AppState::new(config, store.clone(), runner, crontab.clone()));

    Harness {
        router: build_router(state),
        store,
        crontab,
        _dir: dir,
    }
}

fn path_str(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

fn nightly_report() -> Schedule {
    Schedule {
        id: 0,
        name: "nightly-report".into(),
        app_name: "reports".into(),
        schedule: "0 3 * * *".into(),
        region: "ord".into(),
        command: "bin/report".into(),
        command_timeout: 120,
        enabled: true,
        config: MachineConfig {
            image: "registry.example/reports:1".into(),
            ..MachineConfig::default()
        },
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json body")
}

#[tokio::test]
async fn health_reports_mode_and_version() {
    let h = harness();
    let (status, body) = send(&h.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["execution_mode"], "exec");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn trigger_unknown_schedule_is_server_error() {
    let h = harness();
    let (status, body) = send(&h.router, post_json("/command/jobs/trigger", r#"{"id": 41}"#)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(&body)["error"].as_str().unwrap().contains("41"));
}

#[tokio::test]
async fn trigger_malformed_body_is_server_error() {
    let h = harness();
    let (status, body) = send(&h.router, post_json("/command/jobs/trigger", "{not json")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(&body)["error"].is_string());
}

#[tokio::test]
async fn trigger_records_provisioning_failure_on_job() {
    let h = harness();
    let schedule = h.store.create_schedule(&nightly_report()).unwrap();

    let (status, body) = send(
        &h.router,
        post_json("/command/jobs/trigger", &json!({ "id": schedule.id }).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(&body)["error"]
        .as_str()
        .unwrap()
        .contains("no route to reports"));

    let jobs = h.store.list_jobs(schedule.id, 10).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].exit_code, Some(1));
    assert!(jobs[0].machine_id.is_none());
    assert!(jobs[0].finished_at.is_some());
}

#[tokio::test]
async fn trigger_finishes_job_after_client_disconnects() {
    let machines = SlowExec::default();
    let h = harness_with(Arc::new(machines.clone()));
    let schedule = h.store.create_schedule(&nightly_report()).unwrap();

    let request = post_json("/command/jobs/trigger", &json!({ "id": schedule.id }).to_string());
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), h.router.clone().oneshot(request)).await;
    assert!(abandoned.is_err());
    machines.release.notify_one();

    let job = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = h.store.list_jobs(schedule.id, 1).unwrap().remove(0);
            if job.status.is_terminal() && !machines.destroyed.lock().unwrap().is_empty() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job finished");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stdout.as_deref(), Some("report sent"));
    assert_eq!(*machines.destroyed.lock().unwrap(), vec!["m-slow".to_string()]);
}

#[tokio::test]
async fn create_schedule_then_reject_duplicate() {
    let h = harness();
    let payload = json!({
        "name": "nightly-report",
        "app_name": "reports",
        "schedule": "0 3 * * *",
        "command": "bin/report",
        "enabled": true,
        "config": { "image": "registry.example/reports:1" }
    })
    .to_string();

    let (status, body) = send(&h.router, post_json("/command/schedules", &payload)).await;
    assert_eq!(status, StatusCode::CREATED);
    let created = json_body(&body);
    assert!(created["id"].as_i64().unwrap() > 0);
    // Unset timeout is persisted as the default.
    assert_eq!(created["command_timeout"], 30);

    let installed = h.crontab.installed.lock().unwrap().clone();
    assert_eq!(installed.len(), 1);
    assert!(installed[0].starts_with("0 3 * * * /usr/local/bin/process-job "));

    let (status, body) = send(&h.router, post_json("/command/schedules", &payload)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json_body(&body)["error"].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn create_schedule_requires_name() {
    let h = harness();
    let payload = json!({
        "name": " ",
        "app_name": "reports",
        "schedule": "0 3 * * *",
        "command": "bin/report"
    })
    .to_string();
    let (status, _) = send(&h.router, post_json("/command/schedules", &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.store.list_schedules().unwrap().is_empty());
}

#[tokio::test]
async fn list_and_delete_schedules() {
    let h = harness();
    h.store.create_schedule(&nightly_report()).unwrap();

    let (status, body) = send(&h.router, get("/command/schedules")).await;
    assert_eq!(status, StatusCode::OK);
    let listed = json_body(&body);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["name"], "nightly-report");

    let delete = Request::builder()
        .method("DELETE")
        .uri("/command/schedules/nightly-report")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.router, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["deleted"], "nightly-report");
    assert!(h.store.list_schedules().unwrap().is_empty());
    assert_eq!(h.crontab.installed.lock().unwrap().last().unwrap(), "");

    let again = Request::builder()
        .method("DELETE")
        .uri("/command/schedules/nightly-report")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.router, again).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn inspect_jobs() {
    let h = harness();
    let schedule = h.store.create_schedule(&nightly_report()).unwrap();
    let first = h.store.create_job(schedule.id).unwrap();
    let second = h.store.create_job(schedule.id).unwrap();
    h.store.complete_job(first.id, 0, "done\n").unwrap();

    let (status, body) = send(&h.router, get(&format!("/command/jobs/{}", first.id))).await;
    assert_eq!(status, StatusCode::OK);
    let job = json_body(&body);
    assert_eq!(job["status"], "completed");
    assert_eq!(job["stdout"], "done\n");

    let uri = format!("/command/schedules/{}/jobs?limit=1", schedule.id);
    let (status, body) = send(&h.router, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = json_body(&body);
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    assert_eq!(jobs[0]["id"], second.id);

    let (status, _) = send(&h.router, get("/command/jobs/9999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h.router, get("/command/schedules/9999/jobs")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
