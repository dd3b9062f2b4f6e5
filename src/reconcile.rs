//! Orchestration: resolve the VM, snapshot its state, plan, submit, wait,
//! report.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{FactMap, ManagementApi, SubmitError, VmHandle, VmSelector};
use crate::device::{DeviceDescriptor, VmSnapshot};
use crate::error::ReconcileError;
use crate::plan::{plan, TargetState};
use crate::task::{wait_for_task, TaskOutcome, WaitOptions};

/// Options for one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub wait: WaitOptions,
    /// Compute and report the change-set without submitting it.
    pub dry_run: bool,
}

/// What one pass did.
///
/// `failed` with `changed` still true means a change-set was submitted but
/// rejected or its task failed; the attempt counts.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub changed: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<FactMap>,
}

impl ReconcileOutcome {
    fn unchanged(instance: Option<FactMap>) -> Self {
        Self {
            changed: false,
            failed: false,
            message: None,
            instance,
        }
    }

    fn attempt_failed(message: String) -> Self {
        Self {
            changed: true,
            failed: true,
            message: Some(message),
            instance: None,
        }
    }
}

/// Reconciliation engine. One logical operation per `apply` call; holds no
/// mutable state, so concurrent calls on distinct VMs are independent.
pub struct Reconciler {
    api: Arc<dyn ManagementApi>,
    opts: ReconcileOptions,
}

impl Reconciler {
    pub fn new(api: Arc<dyn ManagementApi>) -> Self {
        Self::with_options(api, ReconcileOptions::default())
    }

    pub fn with_options(api: Arc<dyn ManagementApi>, opts: ReconcileOptions) -> Self {
        Self { api, opts }
    }

    /// Drive the floppy configuration of the selected VM to the target.
    pub async fn apply(
        &self,
        selector: &VmSelector,
        target: TargetState,
        desired: &DeviceDescriptor,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let vm = self
            .api
            .resolve_vm(selector)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(selector.to_string()))?;

        let snapshot = self.snapshot(&vm).await?;
        debug!(
            vm = %vm.id,
            power = ?snapshot.power_state,
            template = snapshot.is_template,
            has_device = snapshot.device.is_some(),
            "Snapshot taken"
        );

        let ops = plan(&snapshot, target, desired);
        if ops.is_empty() {
            debug!(vm = %vm.id, "Floppy configuration already converged");
            let facts = self.api.vm_facts(&vm).await?;
            return Ok(ReconcileOutcome::unchanged(Some(facts)));
        }

        info!(vm = %vm.id, ops = ops.len(), "Floppy change-set computed");
        for op in &ops {
            debug!(vm = %vm.id, op = ?op, "Planned operation");
        }

        if self.opts.dry_run {
            return Ok(ReconcileOutcome {
                changed: true,
                failed: false,
                message: Some("check mode: change-set not submitted".to_string()),
                instance: None,
            });
        }

        let task = match self.api.submit_change_set(&vm, &ops).await {
            Ok(task) => task,
            Err(SubmitError::Rejected(message)) => {
                warn!(vm = %vm.id, error = %message, "Change-set rejected");
                return Ok(ReconcileOutcome::attempt_failed(message));
            }
            Err(SubmitError::Api(e)) => return Err(ReconcileError::Api(e)),
        };
        info!(vm = %vm.id, task = %task.id, "Change-set submitted");

        match wait_for_task(self.api.as_ref(), &task, &self.opts.wait).await? {
            TaskOutcome::Failed(message) => Ok(ReconcileOutcome::attempt_failed(message)),
            TaskOutcome::TimedOut => Ok(ReconcileOutcome::attempt_failed(format!(
                "timed out waiting for task {}",
                task.id
            ))),
            TaskOutcome::Success => {
                info!(vm = %vm.id, task = %task.id, "Reconfigure task succeeded");
                let facts = self.api.vm_facts(&vm).await?;
                Ok(ReconcileOutcome {
                    changed: true,
                    failed: false,
                    message: None,
                    instance: Some(facts),
                })
            }
        }
    }

    /// Gather everything the planner reads, in one place. The snapshot is
    /// valid only within this invocation and is discarded afterwards.
    async fn snapshot(&self, vm: &VmHandle) -> Result<VmSnapshot, ReconcileError> {
        let runtime = self.api.vm_runtime(vm).await?;
        let device = self.api.floppy_device(vm).await?;
        let controller = self.api.sio_controller(vm).await?;
        Ok(VmSnapshot {
            power_state: runtime.power_state,
            is_template: runtime.is_template,
            device,
            controller,
        })
    }
}
