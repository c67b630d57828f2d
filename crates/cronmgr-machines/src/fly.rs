//! Machines REST API client (`https://api.machines.dev/v1`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{MachineClient, MachineClientFactory};
use crate::error::{MachineError, Result};
use crate::types::{ExecResult, GuestConfig, LaunchRequest, Machine, MachineState, MANAGED_BY_KEY};

/// The wait endpoint rejects timeouts above one minute.
const MAX_WAIT_SECS: u64 = 60;
/// Slack added on top of server-side timeouts before the HTTP call gives up.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

/// Builds per-app [`FlyMachines`] clients sharing one connection pool.
#[derive(Clone)]
pub struct FlyClientFactory {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl FlyClientFactory {
    pub fn new(api_token: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or_else(|| "https://api.machines.dev/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_token,
        }
    }
}

impl MachineClientFactory for FlyClientFactory {
    fn for_app(&self, app_name: &str) -> Result<Arc<dyn MachineClient>> {
        if app_name.trim().is_empty() {
            return Err(MachineError::Unavailable(
                "schedule has no app_name".to_string(),
            ));
        }
        Ok(Arc::new(FlyMachines {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_token: self.api_token.clone(),
            app_name: app_name.to_string(),
        }))
    }
}

/// Client for one application's machines.
pub struct FlyMachines {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    app_name: String,
}

#[derive(Serialize)]
struct ExecBody<'a> {
    cmd: &'a str,
    timeout: u64,
}

impl FlyMachines {
    fn machines_url(&self) -> String {
        format!("{}/apps/{}/machines", self.base_url, self.app_name)
    }

    fn machine_url(&self, machine_id: &str) -> String {
        format!("{}/{}", self.machines_url(), machine_id)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_token)
    }

    /// Turn a non-2xx response into a `MachineError`, mapping 404 to `NotFound`.
    async fn check(resp: reqwest::Response, machine_id: Option<&str>) -> Result<reqwest::Response> {
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        if status == 404 {
            if let Some(id) = machine_id {
                return Err(MachineError::NotFound {
                    machine_id: id.to_string(),
                });
            }
        }
        let text = resp.text().await.unwrap_or_default();
        warn!(status, body = %text, "Machines API error");
        Err(MachineError::Api {
            status,
            message: text,
        })
    }
}

/// Fill the fields the API requires but schedule files may leave out.
fn prepare_launch(req: &LaunchRequest) -> LaunchRequest {
    let mut req = req.clone();
    if req.config.guest.is_none() {
        req.config.guest = Some(GuestConfig::default());
    }
    req.config
        .metadata
        .insert(MANAGED_BY_KEY.to_string(), "true".to_string());
    req
}

#[async_trait]
impl MachineClient for FlyMachines {
    fn app_name(&self) -> &str {
        &self.app_name
    }

    async fn launch(&self, req: &LaunchRequest) -> Result<Machine> {
        let body = prepare_launch(req);
        debug!(app_name = %self.app_name, image = %body.config.image, "launching machine");

        let resp = self
            .authed(self.client.post(self.machines_url()))
            .json(&body)
            .send()
            .await?;
        let machine: Machine = Self::check(resp, None)
            .await?
            .json()
            .await
            .map_err(|e| MachineError::Parse(e.to_string()))?;

        info!(app_name = %self.app_name, machine_id = %machine.id, "machine created");
        Ok(machine)
    }

    async fn wait_for_state(
        &self,
        machine: &Machine,
        state: MachineState,
        timeout: Duration,
    ) -> Result<()> {
        let secs = timeout.as_secs().clamp(1, MAX_WAIT_SECS);
        let url = format!("{}/wait", self.machine_url(&machine.id));
        let timed_out = || MachineError::Timeout {
            machine_id: machine.id.clone(),
            state,
            secs: timeout.as_secs(),
        };

        let call = self
            .authed(self.client.get(&url))
            .query(&[("state", state.to_string()), ("timeout", secs.to_string())])
            .send();
        let resp = tokio::time::timeout(Duration::from_secs(secs) + REQUEST_SLACK, call)
            .await
            .map_err(|_| timed_out())??;

        // 408 is the API's way of saying the state was not reached in time.
        if resp.status().as_u16() == 408 {
            return Err(timed_out());
        }
        Self::check(resp, Some(&machine.id)).await?;
        Ok(())
    }

    async fn exec(&self, machine_id: &str, command: &str, timeout: Duration) -> Result<ExecResult> {
        let url = format!("{}/exec", self.machine_url(machine_id));
        let body = ExecBody {
            cmd: command,
            timeout: timeout.as_secs(),
        };

        let resp = self
            .authed(self.client.post(&url))
            .timeout(timeout + REQUEST_SLACK)
            .json(&body)
            .send()
            .await?;
        Self::check(resp, Some(machine_id))
            .await?
            .json()
            .await
            .map_err(|e| MachineError::Parse(e.to_string()))
    }

    async fn get(&self, machine_id: &str) -> Result<Machine> {
        let resp = self
            .authed(self.client.get(self.machine_url(machine_id)))
            .send()
            .await?;
        Self::check(resp, Some(machine_id))
            .await?
            .json()
            .await
            .map_err(|e| MachineError::Parse(e.to_string()))
    }

    async fn destroy(&self, machine_id: &str) -> Result<()> {
        let resp = self
            .authed(self.client.delete(self.machine_url(machine_id)))
            .query(&[("force", "true")])
            .send()
            .await?;
        match Self::check(resp, Some(machine_id)).await {
            Ok(_) => {
                debug!(app_name = %self.app_name, %machine_id, "machine destroyed");
                Ok(())
            }
            Err(MachineError::NotFound { .. }) => {
                debug!(app_name = %self.app_name, %machine_id, "machine already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<Machine>> {
        let resp = self
            .authed(self.client.get(self.machines_url()))
            .send()
            .await?;
        Self::check(resp, None)
            .await?
            .json()
            .await
            .map_err(|e| MachineError::Parse(e.to_string()))
    }
}
