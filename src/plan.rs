//! Pure planning core: equivalence check and minimal change-set computation.
//!
//! Given a snapshot of the live device state and the desired descriptor,
//! [`plan`] emits the smallest ordered change-set that makes them converge.
//! Nothing here has side effects; all remote interaction happens in
//! [`crate::reconcile`].

use serde::{Deserialize, Serialize};

use crate::device::{
    BackingKind, CurrentDeviceState, DeviceDescriptor, DeviceKind, PowerState, VmSnapshot,
};

/// Overall target for the floppy drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Present,
    Absent,
}

/// Full replacement device spec. Always constructed whole, never a partial
/// patch of the existing device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    /// Key of the controller to attach to. `None` means "the controller
    /// added earlier in this same change-set".
    pub controller_key: Option<i32>,
    #[serde(flatten)]
    pub kind: DeviceKind,
    pub allow_guest_control: bool,
    pub start_connected: bool,
    /// Immediate connection state, set only when the VM is powered on.
    /// Affects the running guest now; `start_connected` only affects the
    /// next boot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
}

/// One entry of a reconfigure change-set, in resolved order (controller
/// before device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOperation {
    AddController,
    AddDevice(DeviceChange),
    EditDevice { key: i32, change: DeviceChange },
    RemoveDevice { key: i32 },
}

/// Whether the live device already satisfies the descriptor.
///
/// Pure; this is what gates whether any mutating call is issued at all.
/// The `connected` flag is only meaningful while the VM is powered on, so
/// it is ignored otherwise.
pub fn is_equivalent(
    current: &CurrentDeviceState,
    desired: &DeviceDescriptor,
    power_state: PowerState,
) -> bool {
    if !current.allow_guest_control {
        return false;
    }

    let backing_matches = match (&desired.kind, &current.backing) {
        (DeviceKind::Disconnected, BackingKind::RemoteRedirect) => true,
        (DeviceKind::ClientRedirected, BackingKind::RemoteRedirect) => true,
        (DeviceKind::ImageBacked { image_path }, BackingKind::Image { path }) => {
            image_path == path
        }
        _ => false,
    };
    if !backing_matches {
        return false;
    }

    if current.start_connected != desired.effective_start_connected() {
        return false;
    }

    power_state != PowerState::PoweredOn
        || current.connected == !desired.kind.is_disconnected()
}

/// Compute the ordered change-set for one reconciliation pass.
///
/// Template VMs never get hardware changes; both targets produce an empty
/// plan there, which the caller reports as a no-op rather than an error.
pub fn plan(
    snapshot: &VmSnapshot,
    target: TargetState,
    desired: &DeviceDescriptor,
) -> Vec<ChangeOperation> {
    if snapshot.is_template {
        return Vec::new();
    }

    match target {
        TargetState::Absent => match &snapshot.device {
            Some(device) => vec![ChangeOperation::RemoveDevice { key: device.key }],
            None => Vec::new(),
        },
        TargetState::Present => match &snapshot.device {
            None => {
                let mut ops = Vec::new();
                let controller_key = match snapshot.controller {
                    Some(controller) => Some(controller.key),
                    None => {
                        ops.push(ChangeOperation::AddController);
                        None
                    }
                };
                ops.push(ChangeOperation::AddDevice(device_change(
                    desired,
                    controller_key,
                    snapshot.power_state,
                )));
                ops
            }
            Some(device) if !is_equivalent(device, desired, snapshot.power_state) => {
                vec![ChangeOperation::EditDevice {
                    key: device.key,
                    change: device_change(
                        desired,
                        snapshot.controller.map(|c| c.key),
                        snapshot.power_state,
                    ),
                }]
            }
            Some(_) => Vec::new(),
        },
    }
}

fn device_change(
    desired: &DeviceDescriptor,
    controller_key: Option<i32>,
    power_state: PowerState,
) -> DeviceChange {
    DeviceChange {
        controller_key,
        kind: desired.kind.clone(),
        allow_guest_control: true,
        start_connected: desired.effective_start_connected(),
        connected: (power_state == PowerState::PoweredOn)
            .then(|| !desired.kind.is_disconnected()),
    }
}
