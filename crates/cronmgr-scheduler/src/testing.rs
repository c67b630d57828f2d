//! In-process stand-ins for the Machines API and store fixtures.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cronmgr_machines::{
    ExecResult, LaunchRequest, Machine, MachineClient, MachineClientFactory, MachineConfig,
    MachineError, MachineEvent, MachineState, MANAGED_BY_KEY,
};
use cronmgr_machines::types::{EventRequest, ExitEvent};
use rusqlite::Connection;
use tokio::sync::Notify;

use crate::store::Store;
use crate::types::Schedule;

pub(crate) fn test_store() -> Arc<Store> {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    Arc::new(Store::new(conn).expect("migrate"))
}

pub(crate) fn uptime_check() -> Schedule {
    Schedule {
        id: 0,
        name: "uptime-check".to_string(),
        app_name: "cron-jobs".to_string(),
        schedule: "* * * * *".to_string(),
        region: "iad".to_string(),
        command: "uptime".to_string(),
        command_timeout: 60,
        enabled: true,
        config: MachineConfig {
            image: "ghcr.io/livebook-dev/livebook:0.11.4".to_string(),
            ..MachineConfig::default()
        },
    }
}

/// Build an event the way the provider reports it.
pub(crate) fn event(kind: &str, exit_code: Option<i32>, at_ms: i64) -> MachineEvent {
    MachineEvent {
        kind: kind.to_string(),
        status: String::new(),
        source: "flyd".to_string(),
        timestamp: at_ms,
        request: exit_code.map(|code| EventRequest {
            exit_event: Some(ExitEvent {
                exit_code: code,
                ..ExitEvent::default()
            }),
        }),
    }
}

#[derive(Default)]
struct FakeState {
    /// (app, machine) pairs; destroyed machines stay until forgotten.
    machines: Vec<(String, Machine)>,
    next_id: u32,
    launched: Vec<LaunchRequest>,
    destroyed: Vec<String>,
    launch_error: Option<String>,
    wait_error: bool,
    exec_result: ExecResult,
    exec_error: Option<String>,
    exec_panics: bool,
    /// When set, exec blocks until the gate is notified.
    exec_gate: Option<Arc<Notify>>,
    destroy_error: Option<String>,
    list_errors: BTreeSet<String>,
    /// Machines launched from now on are `started` right away.
    auto_start: bool,
}

/// Scriptable provider shared by every client it hands out.
#[derive(Clone, Default)]
pub(crate) struct FakeMachines {
    state: Arc<Mutex<FakeState>>,
    app: String,
}

impl FakeMachines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_launch(&self, message: &str) {
        self.state.lock().unwrap().launch_error = Some(message.to_string());
    }

    pub fn fail_wait(&self) {
        self.state.lock().unwrap().wait_error = true;
    }

    pub fn exec_returns(&self, exit_code: i32, stdout: &str, stderr: &str) {
        self.state.lock().unwrap().exec_result = ExecResult {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
    }

    pub fn fail_exec(&self, message: &str) {
        self.state.lock().unwrap().exec_error = Some(message.to_string());
    }

    pub fn panic_on_exec(&self) {
        self.state.lock().unwrap().exec_panics = true;
    }

    /// Make exec hang until the returned gate is notified.
    pub fn hold_exec(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().exec_gate = Some(gate.clone());
        gate
    }

    pub fn fail_destroy(&self, message: &str) {
        self.state.lock().unwrap().destroy_error = Some(message.to_string());
    }

    pub fn fail_list(&self, app: &str) {
        self.state.lock().unwrap().list_errors.insert(app.to_string());
    }

    pub fn auto_start(&self) {
        self.state.lock().unwrap().auto_start = true;
    }

    /// Register a machine as if some earlier process had launched it.
    pub fn insert(&self, app: &str, machine: Machine) {
        self.state
            .lock()
            .unwrap()
            .machines
            .push((app.to_string(), machine));
    }

    /// Drop a machine entirely, as the provider does once it ages out.
    pub fn forget(&self, machine_id: &str) {
        self.state
            .lock()
            .unwrap()
            .machines
            .retain(|(_, m)| m.id != machine_id);
    }

    pub fn set_state(&self, machine_id: &str, state: MachineState) {
        self.with_machine(machine_id, |m| m.state = state);
    }

    /// Prepend an event; the provider lists events newest first.
    pub fn push_event(&self, machine_id: &str, event: MachineEvent) {
        self.with_machine(machine_id, |m| m.events.insert(0, event));
    }

    pub fn machine(&self, machine_id: &str) -> Option<Machine> {
        self.state
            .lock()
            .unwrap()
            .machines
            .iter()
            .find(|(_, m)| m.id == machine_id)
            .map(|(_, m)| m.clone())
    }

    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    fn with_machine(&self, machine_id: &str, f: impl FnOnce(&mut Machine)) {
        let mut state = self.state.lock().unwrap();
        if let Some((_, m)) = state.machines.iter_mut().find(|(_, m)| m.id == machine_id) {
            f(m);
        }
    }
}

/// A managed machine in `state` with the given events.
pub(crate) fn managed_machine(id: &str, state: MachineState, events: Vec<MachineEvent>) -> Machine {
    let mut config = MachineConfig::default();
    config
        .metadata
        .insert(MANAGED_BY_KEY.to_string(), "true".to_string());
    Machine {
        id: id.to_string(),
        name: String::new(),
        state,
        region: "iad".to_string(),
        config: Some(config),
        events,
    }
}

impl MachineClientFactory for FakeMachines {
    fn for_app(&self, app_name: &str) -> cronmgr_machines::Result<Arc<dyn MachineClient>> {
        if app_name.is_empty() {
            return Err(MachineError::Unavailable("schedule has no app_name".to_string()));
        }
        Ok(Arc::new(FakeMachines {
            state: self.state.clone(),
            app: app_name.to_string(),
        }))
    }
}

#[async_trait]
impl MachineClient for FakeMachines {
    fn app_name(&self) -> &str {
        &self.app
    }

    async fn launch(&self, req: &LaunchRequest) -> cronmgr_machines::Result<Machine> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.launch_error {
            return Err(MachineError::Unavailable(message.clone()));
        }
        state.next_id += 1;
        let now = Utc::now().timestamp_millis();
        let mut config = req.config.clone();
        config
            .metadata
            .insert(MANAGED_BY_KEY.to_string(), "true".to_string());
        let mut machine = Machine {
            id: format!("m-{}", state.next_id),
            name: req.name.clone().unwrap_or_default(),
            state: MachineState::Created,
            region: req.region.clone(),
            config: Some(config),
            events: vec![event("launch", None, now)],
        };
        if state.auto_start {
            machine.state = MachineState::Started;
            machine.events.insert(0, event("start", None, now));
        }
        state.launched.push(req.clone());
        state.machines.push((self.app.clone(), machine.clone()));
        Ok(machine)
    }

    async fn wait_for_state(
        &self,
        machine: &Machine,
        target: MachineState,
        timeout: Duration,
    ) -> cronmgr_machines::Result<()> {
        if self.state.lock().unwrap().wait_error {
            return Err(MachineError::Timeout {
                machine_id: machine.id.clone(),
                state: target,
                secs: timeout.as_secs(),
            });
        }
        let now = Utc::now().timestamp_millis();
        self.with_machine(&machine.id, |m| {
            m.state = target;
            if target == MachineState::Started {
                m.events.insert(0, event("start", None, now));
            }
        });
        Ok(())
    }

    async fn exec(
        &self,
        machine_id: &str,
        _command: &str,
        _timeout: Duration,
    ) -> cronmgr_machines::Result<ExecResult> {
        let gate = self.state.lock().unwrap().exec_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let (panics, error, result) = {
            let state = self.state.lock().unwrap();
            (
                state.exec_panics,
                state.exec_error.clone(),
                state.exec_result.clone(),
            )
        };
        if panics {
            panic!("exec blew up on {machine_id}");
        }
        match error {
            Some(message) => Err(MachineError::Api {
                status: 500,
                message,
            }),
            None => Ok(result),
        }
    }

    async fn get(&self, machine_id: &str) -> cronmgr_machines::Result<Machine> {
        self.machine(machine_id).ok_or_else(|| MachineError::NotFound {
            machine_id: machine_id.to_string(),
        })
    }

    async fn destroy(&self, machine_id: &str) -> cronmgr_machines::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.destroy_error {
            return Err(MachineError::Api {
                status: 500,
                message: message.clone(),
            });
        }
        state.destroyed.push(machine_id.to_string());
        if let Some((_, m)) = state.machines.iter_mut().find(|(_, m)| m.id == machine_id) {
            m.state = MachineState::Destroyed;
        }
        Ok(())
    }

    async fn list(&self) -> cronmgr_machines::Result<Vec<Machine>> {
        let state = self.state.lock().unwrap();
        if state.list_errors.contains(&self.app) {
            return Err(MachineError::Unavailable(format!("cannot list {}", self.app)));
        }
        Ok(state
            .machines
            .iter()
            .filter(|(app, _)| *app == self.app)
            .map(|(_, m)| m.clone())
            .collect())
    }
}
