//! Desired and observed floppy-drive state.

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

/// Desired backing for the floppy drive.
///
/// The image path lives inside the `ImageBacked` variant, so "path is set
/// iff the drive is image-backed" holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceKind {
    /// Drive is present but disconnected (remote-redirect backing).
    Disconnected,
    /// Drive is redirected to the client console.
    ClientRedirected,
    /// Drive is backed by a datastore image, e.g. `[datastore1] base.flp`.
    ImageBacked { image_path: String },
}

impl DeviceKind {
    /// Parse loose caller input into a kind.
    ///
    /// An image path is mandatory for the image kind; this is checked here,
    /// before anything contacts the remote system.
    pub fn parse(kind: &str, image_file: Option<&str>) -> Result<Self, ReconcileError> {
        match kind {
            "none" => Ok(Self::Disconnected),
            "client" => Ok(Self::ClientRedirected),
            "image" | "flp" => match image_file {
                Some(path) if !path.is_empty() => Ok(Self::ImageBacked {
                    image_path: path.to_string(),
                }),
                _ => Err(ReconcileError::Validation(
                    "image_file is required when kind is 'image'".to_string(),
                )),
            },
            other => Err(ReconcileError::Validation(format!(
                "invalid kind '{other}', permitted values: none, client, image"
            ))),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Caller-declared desired configuration, immutable per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    /// Connect the drive at the next power-on.
    pub start_connected: bool,
}

impl DeviceDescriptor {
    pub fn new(kind: DeviceKind, start_connected: bool) -> Self {
        Self {
            kind,
            start_connected,
        }
    }

    /// The start-connected value actually written to the device: a
    /// disconnected drive never starts connected, whatever the caller said.
    pub fn effective_start_connected(&self) -> bool {
        self.start_connected && !self.kind.is_disconnected()
    }
}

/// Power state of the virtual machine, as reported by the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Backing a live floppy device currently presents to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backing", rename_all = "snake_case")]
pub enum BackingKind {
    RemoteRedirect,
    Image { path: String },
}

/// Read-only snapshot of the live floppy device, taken once per pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentDeviceState {
    /// Device key assigned by the hypervisor.
    pub key: i32,
    #[serde(flatten)]
    pub backing: BackingKind,
    pub allow_guest_control: bool,
    pub start_connected: bool,
    pub connected: bool,
}

/// Handle to the SIO bus controller a floppy must attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRef {
    pub key: i32,
}

/// Everything a planning pass reads, gathered up front. The planner itself
/// never contacts the remote system.
#[derive(Debug, Clone)]
pub struct VmSnapshot {
    pub power_state: PowerState,
    pub is_template: bool,
    pub device: Option<CurrentDeviceState>,
    pub controller: Option<ControllerRef>,
}
