//! Seam to the hypervisor management API.
//!
//! The engine never probes for a working backend itself; the caller injects
//! an implementation of [`ManagementApi`] or reconciliation is not
//! attempted. Everything behind this trait (sessions, auth, object lookup,
//! task transport) is the remote system's business.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::device::{ControllerRef, CurrentDeviceState, PowerState};
use crate::plan::ChangeOperation;

/// Which VM to pick when a name matches more than one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameMatch {
    #[default]
    First,
    Last,
}

/// How the caller identifies the target VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmSelector {
    Name { name: String, name_match: NameMatch },
    Uuid(String),
}

impl fmt::Display for VmSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name { name, .. } => write!(f, "name '{name}'"),
            Self::Uuid(uuid) => write!(f, "uuid '{uuid}'"),
        }
    }
}

/// Resolved VM, as handed out by [`ManagementApi::resolve_vm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub id: String,
    pub name: String,
}

/// Runtime flags read once per pass.
#[derive(Debug, Clone, Copy)]
pub struct VmRuntime {
    pub power_state: PowerState,
    /// Templates forbid hardware reconfiguration.
    pub is_template: bool,
}

/// Asynchronous reconfigure task owned by the remote system. This side only
/// observes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

/// Observed task state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Success,
    Error(String),
}

/// Failure submitting a change-set.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The remote system refused the change outright, e.g. a versioning or
    /// licensing restriction. The message is preserved verbatim.
    #[error("{0}")]
    Rejected(String),

    /// Transport-level failure.
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// Fact mapping returned for the reconciled VM.
pub type FactMap = serde_json::Map<String, serde_json::Value>;

/// Client interface to the hypervisor management API.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Look up a VM by name or uuid. `Ok(None)` means no match.
    async fn resolve_vm(&self, selector: &VmSelector) -> Result<Option<VmHandle>>;

    /// Read power state and template flag.
    async fn vm_runtime(&self, vm: &VmHandle) -> Result<VmRuntime>;

    /// Read the current floppy device, if any.
    async fn floppy_device(&self, vm: &VmHandle) -> Result<Option<CurrentDeviceState>>;

    /// Read the SIO controller, if any.
    async fn sio_controller(&self, vm: &VmHandle) -> Result<Option<ControllerRef>>;

    /// Submit an ordered change-set as one reconfigure task.
    async fn submit_change_set(
        &self,
        vm: &VmHandle,
        ops: &[ChangeOperation],
    ) -> Result<JobHandle, SubmitError>;

    /// Observe the task's current state.
    async fn poll_task(&self, task: &JobHandle) -> Result<JobState>;

    /// Gather facts about the VM for the caller's final report.
    async fn vm_facts(&self, vm: &VmHandle) -> Result<FactMap>;
}
