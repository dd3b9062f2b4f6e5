//! Idempotent reconciliation of a declared floppy-drive configuration
//! against the live device state reported by a hypervisor management API.
//!
//! The caller declares the desired drive (kind, backing image, connectivity)
//! and a target (`present`/`absent`); the engine reads current state,
//! computes the minimal change-set — including lazy creation of the SIO
//! controller the drive attaches to — submits it as one reconfigure task and
//! waits for the task to reach a terminal state. When the live device
//! already satisfies the descriptor, no mutating call is made at all.

pub mod api;
pub mod device;
pub mod error;
pub mod http;
pub mod plan;
pub mod reconcile;
pub mod task;

pub use api::{
    FactMap, JobHandle, JobState, ManagementApi, NameMatch, SubmitError, VmHandle, VmRuntime,
    VmSelector,
};
pub use device::{
    BackingKind, ControllerRef, CurrentDeviceState, DeviceDescriptor, DeviceKind, PowerState,
    VmSnapshot,
};
pub use error::ReconcileError;
pub use http::HttpManagementApi;
pub use plan::{is_equivalent, plan, ChangeOperation, DeviceChange, TargetState};
pub use reconcile::{ReconcileOptions, ReconcileOutcome, Reconciler};
pub use task::{wait_for_task, TaskOutcome, WaitOptions};
