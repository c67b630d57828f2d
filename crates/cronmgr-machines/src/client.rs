use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecResult, LaunchRequest, Machine, MachineState};

/// Narrow view of the remote compute provider, scoped to one application.
///
/// Every call may suspend on the network. Implementations must treat a
/// destroy of an already-missing machine as success.
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Application this client is scoped to.
    fn app_name(&self) -> &str;

    /// Launch a machine. The returned handle carries the provider-assigned ID.
    async fn launch(&self, req: &LaunchRequest) -> Result<Machine>;

    /// Block until `machine` reports `state`, or fail with `Timeout`.
    async fn wait_for_state(
        &self,
        machine: &Machine,
        state: MachineState,
        timeout: Duration,
    ) -> Result<()>;

    /// Run `command` on a started machine and wait for its result.
    async fn exec(&self, machine_id: &str, command: &str, timeout: Duration) -> Result<ExecResult>;

    /// Fetch a machine with its event log. `NotFound` once it aged out.
    async fn get(&self, machine_id: &str) -> Result<Machine>;

    /// Force-destroy a machine. Missing machines count as destroyed.
    async fn destroy(&self, machine_id: &str) -> Result<()>;

    /// All machines in the application.
    async fn list(&self) -> Result<Vec<Machine>>;
}

/// Hands out clients scoped to a target application.
pub trait MachineClientFactory: Send + Sync {
    fn for_app(&self, app_name: &str) -> Result<Arc<dyn MachineClient>>;
}
