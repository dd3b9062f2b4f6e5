//! [`ManagementApi`] client for the management daemon's JSON API, served on
//! a unix socket.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::api::{
    FactMap, JobHandle, JobState, ManagementApi, NameMatch, SubmitError, VmHandle, VmRuntime,
    VmSelector,
};
use crate::device::{ControllerRef, CurrentDeviceState, PowerState};
use crate::plan::ChangeOperation;

#[derive(Debug, Deserialize)]
struct VmDto {
    id: String,
    name: String,
    power_state: PowerState,
    #[serde(default)]
    template: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaskStateDto {
    Running,
    Success,
    Error,
}

#[derive(Debug, Deserialize)]
struct TaskDto {
    state: TaskStateDto,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmittedDto {
    task_id: String,
}

/// HTTP client for the management API socket.
pub struct HttpManagementApi {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl HttpManagementApi {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            socket: socket.into(),
            client,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes)> {
        debug!(method = %method, path = %path, socket = %self.socket.display(), "Management API request");
        let uri = Uri::new(&self.socket, path);

        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        let req = builder.body(Full::from(body.unwrap_or_default()))?;

        let resp = self
            .client
            .request(req)
            .await
            .with_context(|| format!("management API request {path} failed"))?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        Ok((status, bytes))
    }

    /// GET a JSON resource; 404 maps to `None`.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let (status, body) = self.request(Method::GET, path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!(
                "management API returned {status} for {path}: {}",
                String::from_utf8_lossy(&body)
            ));
        }
        Ok(Some(serde_json::from_slice(&body).with_context(|| {
            format!("invalid JSON from management API for {path}")
        })?))
    }
}

#[async_trait]
impl ManagementApi for HttpManagementApi {
    async fn resolve_vm(&self, selector: &VmSelector) -> Result<Option<VmHandle>> {
        let path = match selector {
            VmSelector::Uuid(uuid) => format!("/api/v1/vms?uuid={uuid}"),
            VmSelector::Name { name, .. } => format!("/api/v1/vms?name={name}"),
        };
        let vms: Vec<VmDto> = self.get_json(&path).await?.unwrap_or_default();

        let vm = match selector {
            VmSelector::Name {
                name_match: NameMatch::Last,
                ..
            } => vms.into_iter().next_back(),
            _ => vms.into_iter().next(),
        };
        Ok(vm.map(|v| VmHandle {
            id: v.id,
            name: v.name,
        }))
    }

    async fn vm_runtime(&self, vm: &VmHandle) -> Result<VmRuntime> {
        let dto: VmDto = self
            .get_json(&format!("/api/v1/vms/{}", vm.id))
            .await?
            .ok_or_else(|| anyhow!("VM {} disappeared during reconciliation", vm.id))?;
        Ok(VmRuntime {
            power_state: dto.power_state,
            is_template: dto.template,
        })
    }

    async fn floppy_device(&self, vm: &VmHandle) -> Result<Option<CurrentDeviceState>> {
        self.get_json(&format!("/api/v1/vms/{}/floppy", vm.id)).await
    }

    async fn sio_controller(&self, vm: &VmHandle) -> Result<Option<ControllerRef>> {
        self.get_json(&format!("/api/v1/vms/{}/sio-controller", vm.id))
            .await
    }

    async fn submit_change_set(
        &self,
        vm: &VmHandle,
        ops: &[ChangeOperation],
    ) -> Result<JobHandle, SubmitError> {
        let body = serde_json::to_vec(ops)
            .context("failed to encode change-set")
            .map_err(SubmitError::Api)?;
        let path = format!("/api/v1/vms/{}/reconfigure", vm.id);
        let (status, resp) = self
            .request(Method::POST, &path, Some(body))
            .await
            .map_err(SubmitError::Api)?;

        // The daemon refuses restricted reconfigurations outright; keep its
        // message verbatim for the caller.
        if status == StatusCode::FORBIDDEN || status == StatusCode::CONFLICT {
            return Err(SubmitError::Rejected(
                String::from_utf8_lossy(&resp).into_owned(),
            ));
        }
        if !status.is_success() {
            return Err(SubmitError::Api(anyhow!(
                "management API returned {status} for {path}: {}",
                String::from_utf8_lossy(&resp)
            )));
        }

        let submitted: SubmittedDto = serde_json::from_slice(&resp)
            .context("invalid reconfigure response")
            .map_err(SubmitError::Api)?;
        Ok(JobHandle {
            id: submitted.task_id,
        })
    }

    async fn poll_task(&self, task: &JobHandle) -> Result<JobState> {
        let dto: TaskDto = self
            .get_json(&format!("/api/v1/tasks/{}", task.id))
            .await?
            .ok_or_else(|| anyhow!("task {} not found", task.id))?;
        Ok(match dto.state {
            TaskStateDto::Running => JobState::Running,
            TaskStateDto::Success => JobState::Success,
            TaskStateDto::Error => {
                JobState::Error(dto.message.unwrap_or_else(|| "task failed".to_string()))
            }
        })
    }

    async fn vm_facts(&self, vm: &VmHandle) -> Result<FactMap> {
        Ok(self
            .get_json(&format!("/api/v1/vms/{}/facts", vm.id))
            .await?
            .unwrap_or_default())
    }
}
