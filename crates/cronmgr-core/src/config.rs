use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

// Defaults mirror the paths baked into the deployment image.
pub const DEFAULT_CONFIG_PATH: &str = "/data/cron-manager.toml";
pub const DEFAULT_DB_PATH: &str = "/data/state.db";
pub const DEFAULT_SCHEDULES_PATH: &str = "/usr/local/share/schedules.json";
pub const DEFAULT_CRONTAB_PATH: &str = "/data/crontab";
pub const DEFAULT_EXECUTABLE: &str = "/usr/local/bin/process-job";
pub const DEFAULT_API_PORT: u16 = 5500;
pub const DEFAULT_API_BIND: &str = "0.0.0.0";
pub const DEFAULT_MACHINES_API: &str = "https://api.machines.dev/v1";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MONITOR_CONCURRENCY: usize = 8;
pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Env var holding the Machines API token.
pub const API_TOKEN_ENV: &str = "FLY_API_TOKEN";
/// Env var pointing at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "CRON_MANAGER_CONFIG";
/// Prefix for per-field overrides, e.g. `CRON_MANAGER_MONITOR__INTERVAL_SECS=10`.
pub const ENV_PREFIX: &str = "CRON_MANAGER_";

/// Top-level config (cron-manager.toml + CRON_MANAGER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronManagerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schedules: SchedulesConfig,
    #[serde(default)]
    pub crontab: CrontabConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub machines: MachinesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Location of the declarative schedule definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulesConfig {
    #[serde(default = "default_schedules_path")]
    pub path: String,
}

impl Default for SchedulesConfig {
    fn default() -> Self {
        Self {
            path: default_schedules_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrontabConfig {
    /// Canonical copy of the last successfully installed crontab.
    #[serde(default = "default_crontab_path")]
    pub path: String,
    /// Binary invoked by every crontab line with the schedule ID appended.
    #[serde(default = "default_executable")]
    pub executable: String,
}

impl Default for CrontabConfig {
    fn default() -> Self {
        Self {
            path: default_crontab_path(),
            executable: default_executable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    /// Upper bound on concurrent job evaluations within one tick.
    #[serde(default = "default_monitor_concurrency")]
    pub max_concurrency: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            max_concurrency: default_monitor_concurrency(),
        }
    }
}

/// How a job's command reaches the machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Boot the image, then run the command through the exec endpoint and
    /// wait for its result in the triggering process.
    #[default]
    Exec,
    /// Bake the command into the machine's init; the monitor observes the
    /// exit event and records the result.
    Init,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Exec => write!(f, "exec"),
            ExecutionMode::Init => write!(f, "init"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachinesConfig {
    #[serde(default = "default_machines_api")]
    pub api_base_url: String,
    /// Falls back to `FLY_API_TOKEN` when unset.
    pub api_token: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// How long to wait for a freshly launched machine to reach `started`.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

impl Default for MachinesConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_machines_api(),
            api_token: None,
            execution_mode: ExecutionMode::default(),
            start_timeout_secs: default_start_timeout(),
        }
    }
}

impl MachinesConfig {
    /// Resolve the API token from config or the environment.
    ///
    /// Processes that talk to the provider call this at startup and refuse
    /// to run without a credential.
    pub fn require_api_token(&self) -> Result<String> {
        self.api_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                std::env::var(API_TOKEN_ENV)
                    .ok()
                    .filter(|t| !t.trim().is_empty())
            })
            .ok_or(CoreError::MissingCredential { var: API_TOKEN_ENV })
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}
fn default_schedules_path() -> String {
    DEFAULT_SCHEDULES_PATH.to_string()
}
fn default_crontab_path() -> String {
    DEFAULT_CRONTAB_PATH.to_string()
}
fn default_executable() -> String {
    DEFAULT_EXECUTABLE.to_string()
}
fn default_api_bind() -> String {
    DEFAULT_API_BIND.to_string()
}
fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}
fn default_monitor_interval() -> u64 {
    DEFAULT_MONITOR_INTERVAL_SECS
}
fn default_monitor_concurrency() -> usize {
    DEFAULT_MONITOR_CONCURRENCY
}
fn default_machines_api() -> String {
    DEFAULT_MACHINES_API.to_string()
}
fn default_start_timeout() -> u64 {
    DEFAULT_START_TIMEOUT_SECS
}

impl CronManagerConfig {
    /// Load config from a TOML file with CRON_MANAGER_* env var overrides.
    ///
    /// Path resolution: explicit argument, then `CRON_MANAGER_CONFIG`, then
    /// `/data/cron-manager.toml`. A missing file is not an error; every
    /// section falls back to its defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        Self::figment(&path)
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}
