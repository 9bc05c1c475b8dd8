//! # vCenter Session Gateway
//!
//! Implements [`Gateway`] on top of the vSphere Web Services JSON API
//! (`https://{host}/sdk/vim25/{release}`), the JSON binding of the vim25 SOAP
//! API available on vCenter 8.0U1 and later.
//!
//! ## Session
//!
//! ```text
//! GET  ServiceInstance/ServiceInstance/content    → root folder, managers
//! POST SessionManager/{id}/Login                  → vmware-api-session-id header
//! ...  every later call carries the session header
//! POST SessionManager/{id}/Logout                 → on exit
//! ```
//!
//! ## VM Lookup
//!
//! A container view over the root folder lists every `VirtualMachine`; names
//! are read one by one and the first match wins. Duplicate names are logged.
//!
//! ## Tasks
//!
//! Power and reconfiguration methods return a `Task` reference. The client
//! polls `Task/{id}/info` every [`TASK_POLL_INTERVAL`] until the task reports
//! `success` or `error`, bounded by [`TASK_WAIT_TIMEOUT`] unless the session
//! sets its own bound.
//!
//! ## TLS
//!
//! Certificates are verified unless the session is built with `insecure`,
//! which is meant for lab endpoints with self-signed certificates.

use crate::constants::{
    DEFAULT_API_RELEASE, HTTP_REQUEST_TIMEOUT, SESSION_HEADER, TASK_POLL_INTERVAL,
    TASK_WAIT_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::gateway::{Gateway, PowerState, VmHandle};
use crate::planner::ConfigEntry;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Session Configuration
// =============================================================================

/// Connection settings for a vCenter session.
#[derive(Clone)]
pub struct SessionConfig {
    /// vCenter host name or base URL (`vc.example.com`, `https://vc:8443`).
    pub host: String,
    /// Privileged user, e.g. `administrator@vsphere.local`.
    pub user: String,
    /// Password of `user`.
    pub password: String,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// vim25 JSON API release path segment.
    pub api_release: String,
    /// Timeout for a single HTTP request.
    pub timeout: Duration,
    /// Upper bound on waiting for one remote task.
    pub task_timeout: Duration,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("api_release", &self.api_release)
            .field("timeout", &self.timeout)
            .field("task_timeout", &self.task_timeout)
            .finish()
    }
}

impl SessionConfig {
    /// Creates a configuration with certificate verification on.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            insecure: false,
            api_release: DEFAULT_API_RELEASE.to_string(),
            timeout: HTTP_REQUEST_TIMEOUT,
            task_timeout: TASK_WAIT_TIMEOUT,
        }
    }

    /// Enables or disables TLS certificate verification bypass.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Overrides the API release segment.
    pub fn with_api_release(mut self, release: impl Into<String>) -> Self {
        self.api_release = release.into();
        self
    }

    /// Overrides the bound on a single task wait.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Base URL of the vim25 JSON API.
    ///
    /// A bare host gets the `https://` scheme.
    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        let host = if host.starts_with("https://") || host.starts_with("http://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        format!("{}/sdk/vim25/{}", host, self.api_release.trim_matches('/'))
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// Managed object reference (`{"type": "VirtualMachine", "value": "vm-42"}`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct MoRef {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

impl MoRef {
    fn to_json(&self) -> Value {
        json!({
            "_typeName": "ManagedObjectReference",
            "type": self.kind,
            "value": self.value,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceContent {
    root_folder: MoRef,
    session_manager: MoRef,
    view_manager: MoRef,
    #[serde(default)]
    about: Option<AboutInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutInfo {
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmRuntimeInfo {
    power_state: PowerState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmConfigInfo {
    hardware: VmHardware,
    #[serde(default)]
    extra_config: Vec<OptionValue>,
}

#[derive(Debug, Deserialize)]
struct VmHardware {
    #[serde(rename = "numCPU")]
    num_cpu: u32,
}

/// `OptionValue`; `value` is `anyType`, usually `{"_typeName": "string", "_value": ".."}`.
#[derive(Debug, Deserialize)]
struct OptionValue {
    key: String,
    #[serde(default)]
    value: Value,
}

impl From<OptionValue> for ConfigEntry {
    fn from(option: OptionValue) -> Self {
        let value = match option.value {
            Value::Null => String::new(),
            Value::String(s) => s,
            Value::Object(mut map) => match map.remove("_value") {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            },
            other => other.to_string(),
        };
        ConfigEntry::new(option.key, value)
    }
}

fn option_value_json(entry: &ConfigEntry) -> Value {
    json!({
        "_typeName": "OptionValue",
        "key": entry.key,
        "value": { "_typeName": "string", "_value": entry.value },
    })
}

fn reconfigure_spec(entries: &[ConfigEntry]) -> Value {
    json!({
        "spec": {
            "_typeName": "VirtualMachineConfigSpec",
            "extraConfig": entries.iter().map(option_value_json).collect::<Vec<_>>(),
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskInfo {
    state: TaskState,
    #[serde(default)]
    error: Option<Value>,
}

impl TaskInfo {
    fn failure_reason(&self) -> String {
        self.error
            .as_ref()
            .and_then(|e| e.get("localizedMessage"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.error.as_ref().map(Value::to_string))
            .unwrap_or_else(|| "task reported an error without details".to_string())
    }
}

// =============================================================================
// Client
// =============================================================================

/// Authenticated vCenter session.
pub struct VsphereClient {
    client: Client,
    base_url: String,
    host: String,
    session_id: String,
    content: ServiceContent,
    task_timeout: Duration,
}

impl VsphereClient {
    /// Opens a session: builds the HTTP client, reads the service content
    /// and logs in.
    ///
    /// ## Errors
    ///
    /// - [`Error::Connect`]: unreachable endpoint, TLS failure, bad credentials
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        let base_url = config.base_url();
        let connect_err = |reason: String| Error::Connect {
            host: config.host.clone(),
            reason,
        };

        if config.insecure {
            warn!(host = %config.host, "TLS certificate verification disabled");
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| connect_err(format!("failed to create HTTP client: {e}")))?;

        let response = client
            .get(format!("{base_url}/ServiceInstance/ServiceInstance/content"))
            .send()
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let content: ServiceContent = check(response, "RetrieveServiceContent")
            .await
            .map_err(|e| connect_err(e.to_string()))?
            .json()
            .await
            .map_err(|e| connect_err(format!("invalid service content: {e}")))?;

        let response = client
            .post(format!(
                "{base_url}/SessionManager/{}/Login",
                content.session_manager.value
            ))
            .json(&json!({ "userName": config.user, "password": config.password }))
            .send()
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let response = check(response, "Login")
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| connect_err(format!("login response carried no {SESSION_HEADER}")))?;

        debug!(
            host = %config.host,
            product = content.about.as_ref().and_then(|a| a.full_name.as_deref()).unwrap_or("unknown"),
            "session established"
        );

        Ok(Self {
            client,
            base_url,
            host: config.host,
            session_id,
            content,
            task_timeout: config.task_timeout,
        })
    }

    /// Host this session is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Product name reported by the endpoint, if any.
    pub fn product(&self) -> Option<&str> {
        self.content.about.as_ref()?.full_name.as_deref()
    }

    /// Ends the session.
    pub async fn logout(&self) -> Result<()> {
        let path = format!("SessionManager/{}/Logout", self.content.session_manager.value);
        self.send(self.client.post(self.url(&path)), "Logout").await?;
        debug!(host = %self.host, "session closed");
        Ok(())
    }

    // =========================================================================
    // Request Helpers
    // =========================================================================

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response> {
        let response = request
            .header(SESSION_HEADER, &self.session_id)
            .send()
            .await
            .map_err(|e| Error::request(operation, e))?;
        check(response, operation).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, operation: &str) -> Result<T> {
        let response = self.send(self.client.get(self.url(path)), operation).await?;
        decode(response, operation).await
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&Value>,
        operation: &str,
    ) -> Result<T> {
        let mut request = self.client.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.send(request, operation).await?;
        decode(response, operation).await
    }

    /// Waits for a task to succeed or fail, bounded by the session's task timeout.
    async fn wait_for_task(&self, task: &MoRef, operation: &str) -> Result<()> {
        tokio::time::timeout(self.task_timeout, self.poll_task(task, operation))
            .await
            .map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                duration: self.task_timeout,
            })?
    }

    async fn poll_task(&self, task: &MoRef, operation: &str) -> Result<()> {
        let path = format!("Task/{}/info", task.value);
        loop {
            let info: TaskInfo = self.get(&path, operation).await?;
            match info.state {
                TaskState::Success => return Ok(()),
                TaskState::Error => {
                    return Err(Error::TaskFailed {
                        operation: operation.to_string(),
                        reason: info.failure_reason(),
                    });
                }
                TaskState::Queued | TaskState::Running => {
                    debug!(task = %task.value, operation, state = ?info.state, "waiting for task");
                    tokio::time::sleep(TASK_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn run_vm_task(
        &self,
        vm: &VmHandle,
        method: &str,
        body: Option<&Value>,
    ) -> Result<()> {
        let operation = format!("{method} {}", vm.name);
        let task: MoRef = self
            .invoke(&format!("VirtualMachine/{}/{method}", vm.id), body, &operation)
            .await?;
        self.wait_for_task(&task, &operation).await
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Ids of every VM named `name`, in inventory order.
    async fn vm_ids_named(&self, name: &str) -> Result<Vec<String>> {
        let body = json!({
            "container": self.content.root_folder.to_json(),
            "type": ["VirtualMachine"],
            "recursive": true,
        });
        let view: MoRef = self
            .invoke(
                &format!("ViewManager/{}/CreateContainerView", self.content.view_manager.value),
                Some(&body),
                "CreateContainerView",
            )
            .await?;

        let matches = self.scan_view(&view, name).await;

        let destroy = self
            .send(
                self.client
                    .post(self.url(&format!("ContainerView/{}/DestroyView", view.value))),
                "DestroyView",
            )
            .await;
        if let Err(e) = destroy {
            warn!(view = %view.value, error = %e, "failed to destroy container view");
        }

        matches
    }

    async fn scan_view(&self, view: &MoRef, name: &str) -> Result<Vec<String>> {
        let members: Vec<MoRef> = self
            .get(&format!("ContainerView/{}/view", view.value), "ContainerView.view")
            .await?;
        debug!(count = members.len(), "scanning virtual machines");

        let mut ids = Vec::new();
        for member in members {
            let vm_name: String = self
                .get(&format!("VirtualMachine/{}/name", member.value), "VirtualMachine.name")
                .await?;
            if vm_name == name {
                ids.push(member.value);
            }
        }
        Ok(ids)
    }

    async fn load_vm(&self, id: String, name: &str) -> Result<VmHandle> {
        let runtime: VmRuntimeInfo = self
            .get(&format!("VirtualMachine/{id}/runtime"), "VirtualMachine.runtime")
            .await?;
        let config: VmConfigInfo = self
            .get(&format!("VirtualMachine/{id}/config"), "VirtualMachine.config")
            .await?;

        Ok(VmHandle {
            id,
            name: name.to_string(),
            power_state: runtime.power_state,
            vcpu_count: config.hardware.num_cpu,
            extra_config: config.extra_config.into_iter().map(ConfigEntry::from).collect(),
        })
    }
}

#[async_trait]
impl Gateway for VsphereClient {
    async fn find_vm(&self, name: &str) -> Result<Option<VmHandle>> {
        let mut ids = self.vm_ids_named(name).await?;
        if ids.len() > 1 {
            warn!(vm = %name, matches = ids.len(), id = %ids[0], "duplicate VM name, using first match");
        }
        if ids.is_empty() {
            return Ok(None);
        }
        let id = ids.swap_remove(0);
        self.load_vm(id, name).await.map(Some)
    }

    async fn power_state(&self, vm: &VmHandle) -> Result<PowerState> {
        let runtime: VmRuntimeInfo = self
            .get(&format!("VirtualMachine/{}/runtime", vm.id), "VirtualMachine.runtime")
            .await?;
        Ok(runtime.power_state)
    }

    async fn power_on(&self, vm: &VmHandle) -> Result<()> {
        info!(vm = %vm.name, "powering on");
        self.run_vm_task(vm, "PowerOnVM_Task", None).await
    }

    async fn power_off(&self, vm: &VmHandle) -> Result<()> {
        info!(vm = %vm.name, "powering off");
        self.run_vm_task(vm, "PowerOffVM_Task", None).await
    }

    async fn reconfigure(&self, vm: &VmHandle, entries: &[ConfigEntry]) -> Result<()> {
        let body = reconfigure_spec(entries);
        self.run_vm_task(vm, "ReconfigVM_Task", Some(&body)).await?;
        info!(vm = %vm.name, entries = entries.len(), "VM re-configured");
        Ok(())
    }
}

// =============================================================================
// Response Handling
// =============================================================================

/// Turns a non-2xx response into [`Error::Request`] carrying the fault body.
async fn check(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::request(operation, format!("HTTP {status}: {}", body.trim())))
}

async fn decode<T: DeserializeOwned>(response: Response, operation: &str) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::request(operation, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidResponse(format!("{operation}: {e}")))
}
