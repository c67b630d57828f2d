use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key marking a machine as launched by cron-manager.
pub const MANAGED_BY_KEY: &str = "managed-by-cron-manager";
/// Metadata key carrying the job the machine was launched for.
pub const JOB_ID_KEY: &str = "cron-manager-job-id";
/// Metadata key carrying the owning schedule's name.
pub const SCHEDULE_KEY: &str = "cron-manager-schedule";

/// Lifecycle state reported by the Machines API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Replacing,
    Destroying,
    Destroyed,
    /// Any state this client does not know about yet.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineState::Created => "created",
            MachineState::Starting => "starting",
            MachineState::Started => "started",
            MachineState::Stopping => "stopping",
            MachineState::Stopped => "stopped",
            MachineState::Suspending => "suspending",
            MachineState::Suspended => "suspended",
            MachineState::Replacing => "replacing",
            MachineState::Destroying => "destroying",
            MachineState::Destroyed => "destroyed",
            MachineState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Guest resource shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub cpu_kind: String,
    pub cpus: u32,
    pub memory_mb: u32,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            cpu_kind: "shared".to_string(),
            cpus: 1,
            memory_mb: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default)]
    pub max_retries: u32,
    pub policy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
}

/// Launch configuration for a machine.
///
/// Only the fields cron-manager reads or writes are typed; anything else in
/// the definition is carried through `extra` untouched so schedule files can
/// use the full Machines API config surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub auto_destroy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Everything needed to launch one machine.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvent {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub oom_killed: bool,
    #[serde(default)]
    pub requested_stop: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRequest {
    #[serde(default)]
    pub exit_event: Option<ExitEvent>,
}

/// One entry of a machine's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub source: String,
    /// Unix epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub request: Option<EventRequest>,
}

impl MachineEvent {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.request
            .as_ref()
            .and_then(|r| r.exit_event.as_ref())
            .map(|e| e.exit_code)
    }
}

/// A machine as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub state: MachineState,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub config: Option<MachineConfig>,
    /// Most recent first, as returned by the API.
    #[serde(default)]
    pub events: Vec<MachineEvent>,
}

impl Machine {
    /// Most recent event of the given type.
    pub fn find_event(&self, kind: &str) -> Option<&MachineEvent> {
        self.events.iter().find(|e| e.kind == kind)
    }

    /// True when the machine carries the cron-manager ownership tag.
    pub fn is_managed(&self) -> bool {
        self.config
            .as_ref()
            .and_then(|c| c.metadata.get(MANAGED_BY_KEY))
            .is_some_and(|v| v == "true")
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.find_event("start").and_then(MachineEvent::time)
    }

    /// Exit code carried by the latest `exit` event, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.find_event("exit").and_then(MachineEvent::exit_code)
    }

    /// Seconds between the start event and the exit event (or `now` while
    /// the machine is still running). Zero when it never started.
    pub fn execution_secs(&self, now: DateTime<Utc>) -> f64 {
        let Some(start) = self.started_at() else {
            return 0.0;
        };
        let end = self
            .find_event("exit")
            .and_then(MachineEvent::time)
            .unwrap_or(now);
        (end - start).num_milliseconds() as f64 / 1000.0
    }
}

/// Result of a remote command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecResult {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}
