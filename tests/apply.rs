//! End-to-end reconciliation passes against an in-memory management API.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use vmfloppy::{
    BackingKind, ChangeOperation, ControllerRef, CurrentDeviceState, DeviceDescriptor, DeviceKind,
    FactMap, JobHandle, JobState, ManagementApi, NameMatch, PowerState, ReconcileError,
    Reconciler, SubmitError, TargetState, VmHandle, VmRuntime, VmSelector,
};

const CONTROLLER_KEY: i32 = 400;
const DEVICE_KEY: i32 = 8000;

#[derive(Clone)]
struct FakeVm {
    id: String,
    name: String,
    power_state: PowerState,
    is_template: bool,
    device: Option<CurrentDeviceState>,
    controller: Option<ControllerRef>,
}

impl FakeVm {
    fn new(name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            power_state: PowerState::PoweredOff,
            is_template: false,
            device: None,
            controller: None,
        }
    }
}

#[derive(Default)]
struct FakeState {
    vms: Vec<FakeVm>,
    submitted: Vec<Vec<ChangeOperation>>,
    /// When set, submissions are refused with this message.
    reject_with: Option<String>,
    /// When set, the reconfigure task terminates in error.
    task_error: Option<String>,
}

/// In-memory hypervisor: applies submitted change-sets to its own state so
/// a second pass observes the converged configuration.
struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    fn with_vm(vm: FakeVm) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                vms: vec![vm],
                ..FakeState::default()
            }),
        })
    }

    fn submissions(&self) -> Vec<Vec<ChangeOperation>> {
        self.state.lock().unwrap().submitted.clone()
    }

    fn device_of(&self, vm_id: &str) -> Option<CurrentDeviceState> {
        let state = self.state.lock().unwrap();
        state
            .vms
            .iter()
            .find(|v| v.id == vm_id)
            .and_then(|v| v.device.clone())
    }
}

fn apply_ops(vm: &mut FakeVm, ops: &[ChangeOperation]) {
    for op in ops {
        match op {
            ChangeOperation::AddController => {
                vm.controller = Some(ControllerRef {
                    key: CONTROLLER_KEY,
                });
            }
            ChangeOperation::AddDevice(change) => {
                vm.device = Some(CurrentDeviceState {
                    key: DEVICE_KEY,
                    backing: backing_of(&change.kind),
                    allow_guest_control: change.allow_guest_control,
                    start_connected: change.start_connected,
                    connected: change.connected.unwrap_or(false),
                });
            }
            ChangeOperation::EditDevice { key, change } => {
                vm.device = Some(CurrentDeviceState {
                    key: *key,
                    backing: backing_of(&change.kind),
                    allow_guest_control: change.allow_guest_control,
                    start_connected: change.start_connected,
                    connected: change.connected.unwrap_or(false),
                });
            }
            ChangeOperation::RemoveDevice { .. } => {
                vm.device = None;
            }
        }
    }
}

fn backing_of(kind: &DeviceKind) -> BackingKind {
    match kind {
        DeviceKind::Disconnected | DeviceKind::ClientRedirected => BackingKind::RemoteRedirect,
        DeviceKind::ImageBacked { image_path } => BackingKind::Image {
            path: image_path.clone(),
        },
    }
}

#[async_trait]
impl ManagementApi for FakeApi {
    async fn resolve_vm(&self, selector: &VmSelector) -> Result<Option<VmHandle>> {
        let state = self.state.lock().unwrap();
        let vm = match selector {
            VmSelector::Uuid(uuid) => state.vms.iter().find(|v| &v.id == uuid),
            VmSelector::Name { name, name_match } => {
                let mut matches = state.vms.iter().filter(|v| &v.name == name);
                match name_match {
                    NameMatch::First => matches.next(),
                    NameMatch::Last => matches.last(),
                }
            }
        };
        Ok(vm.map(|v| VmHandle {
            id: v.id.clone(),
            name: v.name.clone(),
        }))
    }

    async fn vm_runtime(&self, vm: &VmHandle) -> Result<VmRuntime> {
        let state = self.state.lock().unwrap();
        let fake = state
            .vms
            .iter()
            .find(|v| v.id == vm.id)
            .ok_or_else(|| anyhow::anyhow!("unknown vm"))?;
        Ok(VmRuntime {
            power_state: fake.power_state,
            is_template: fake.is_template,
        })
    }

    async fn floppy_device(&self, vm: &VmHandle) -> Result<Option<CurrentDeviceState>> {
        Ok(self.device_of(&vm.id))
    }

    async fn sio_controller(&self, vm: &VmHandle) -> Result<Option<ControllerRef>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .vms
            .iter()
            .find(|v| v.id == vm.id)
            .and_then(|v| v.controller))
    }

    async fn submit_change_set(
        &self,
        vm: &VmHandle,
        ops: &[ChangeOperation],
    ) -> Result<JobHandle, SubmitError> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push(ops.to_vec());
        if let Some(message) = &state.reject_with {
            return Err(SubmitError::Rejected(message.clone()));
        }
        if state.task_error.is_none() {
            let vm_id = vm.id.clone();
            if let Some(fake) = state.vms.iter_mut().find(|v| v.id == vm_id) {
                apply_ops(fake, ops);
            }
        }
        Ok(JobHandle {
            id: uuid::Uuid::new_v4().to_string(),
        })
    }

    async fn poll_task(&self, _task: &JobHandle) -> Result<JobState> {
        let state = self.state.lock().unwrap();
        Ok(match &state.task_error {
            Some(message) => JobState::Error(message.clone()),
            None => JobState::Success,
        })
    }

    async fn vm_facts(&self, vm: &VmHandle) -> Result<FactMap> {
        let mut facts = FactMap::new();
        facts.insert("hw_name".to_string(), vm.name.clone().into());
        Ok(facts)
    }
}

fn by_name(name: &str) -> VmSelector {
    VmSelector::Name {
        name: name.to_string(),
        name_match: NameMatch::First,
    }
}

fn client_descriptor() -> DeviceDescriptor {
    DeviceDescriptor::new(DeviceKind::ClientRedirected, true)
}

fn image_descriptor() -> DeviceDescriptor {
    DeviceDescriptor::new(
        DeviceKind::ImageBacked {
            image_path: "[datastore1] base.flp".to_string(),
        },
        true,
    )
}

#[tokio::test]
async fn second_apply_is_a_noop() {
    let api = FakeApi::with_vm(FakeVm::new("web01"));
    let reconciler = Reconciler::new(api.clone());

    let first = reconciler
        .apply(&by_name("web01"), TargetState::Present, &image_descriptor())
        .await
        .unwrap();
    assert!(first.changed);
    assert!(!first.failed);

    let second = reconciler
        .apply(&by_name("web01"), TargetState::Present, &image_descriptor())
        .await
        .unwrap();
    assert!(!second.changed);
    assert!(!second.failed);

    // The converged pass never touched the mutation endpoint.
    assert_eq!(api.submissions().len(), 1);
}

#[tokio::test]
async fn absent_without_device_changes_nothing() {
    let api = FakeApi::with_vm(FakeVm::new("web01"));
    let reconciler = Reconciler::new(api.clone());

    let outcome = reconciler
        .apply(&by_name("web01"), TargetState::Absent, &client_descriptor())
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert!(!outcome.failed);
    assert!(api.submissions().is_empty());
}

#[tokio::test]
async fn absent_removes_existing_device() {
    let mut vm = FakeVm::new("web01");
    vm.controller = Some(ControllerRef {
        key: CONTROLLER_KEY,
    });
    vm.device = Some(CurrentDeviceState {
        key: DEVICE_KEY,
        backing: BackingKind::RemoteRedirect,
        allow_guest_control: true,
        start_connected: true,
        connected: false,
    });
    let vm_id = vm.id.clone();
    let api = FakeApi::with_vm(vm);
    let reconciler = Reconciler::new(api.clone());

    let outcome = reconciler
        .apply(&by_name("web01"), TargetState::Absent, &client_descriptor())
        .await
        .unwrap();
    assert!(outcome.changed);
    assert!(!outcome.failed);
    assert_eq!(
        api.submissions(),
        vec![vec![ChangeOperation::RemoveDevice { key: DEVICE_KEY }]]
    );
    assert!(api.device_of(&vm_id).is_none());
}

#[tokio::test]
async fn unknown_vm_is_not_found() {
    let api = FakeApi::with_vm(FakeVm::new("web01"));
    let reconciler = Reconciler::new(api);

    let err = reconciler
        .apply(&by_name("db01"), TargetState::Present, &client_descriptor())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::NotFound(_)));
}

#[tokio::test]
async fn name_match_last_picks_the_last_duplicate() {
    let first = FakeVm::new("web01");
    let last = FakeVm::new("web01");
    let last_id = last.id.clone();
    let api = Arc::new(FakeApi {
        state: Mutex::new(FakeState {
            vms: vec![first, last],
            ..FakeState::default()
        }),
    });

    let handle = api
        .resolve_vm(&VmSelector::Name {
            name: "web01".to_string(),
            name_match: NameMatch::Last,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.id, last_id);
}

#[tokio::test]
async fn template_vm_is_skipped_silently() {
    let mut vm = FakeVm::new("golden");
    vm.is_template = true;
    vm.device = Some(CurrentDeviceState {
        key: DEVICE_KEY,
        backing: BackingKind::RemoteRedirect,
        allow_guest_control: true,
        start_connected: false,
        connected: false,
    });
    let api = FakeApi::with_vm(vm);
    let reconciler = Reconciler::new(api.clone());

    for target in [TargetState::Present, TargetState::Absent] {
        let outcome = reconciler
            .apply(&by_name("golden"), target, &image_descriptor())
            .await
            .unwrap();
        assert!(!outcome.changed);
        assert!(!outcome.failed);
    }
    assert!(api.submissions().is_empty());
}

#[tokio::test]
async fn rejection_keeps_the_remote_message() {
    let api = FakeApi::with_vm(FakeVm::new("web01"));
    api.state.lock().unwrap().reject_with =
        Some("Current license or ESXi version prohibits execution".to_string());
    let reconciler = Reconciler::new(api.clone());

    let outcome = reconciler
        .apply(&by_name("web01"), TargetState::Present, &client_descriptor())
        .await
        .unwrap();
    assert!(outcome.changed, "an attempt was made");
    assert!(outcome.failed);
    assert_eq!(
        outcome.message.as_deref(),
        Some("Current license or ESXi version prohibits execution")
    );
}

#[tokio::test]
async fn task_failure_is_reported_as_failed_change() {
    let api = FakeApi::with_vm(FakeVm::new("web01"));
    api.state.lock().unwrap().task_error = Some("file not found on datastore".to_string());
    let reconciler = Reconciler::new(api.clone());

    let outcome = reconciler
        .apply(&by_name("web01"), TargetState::Present, &image_descriptor())
        .await
        .unwrap();
    assert!(outcome.changed);
    assert!(outcome.failed);
    assert_eq!(
        outcome.message.as_deref(),
        Some("file not found on datastore")
    );
}

#[tokio::test]
async fn fresh_vm_gets_controller_then_device() {
    let vm = FakeVm::new("web01");
    let vm_id = vm.id.clone();
    let api = FakeApi::with_vm(vm);
    let reconciler = Reconciler::new(api.clone());

    let outcome = reconciler
        .apply(&by_name("web01"), TargetState::Present, &image_descriptor())
        .await
        .unwrap();
    assert!(outcome.changed);
    assert!(!outcome.failed);
    assert!(outcome.instance.is_some());

    let submissions = api.submissions();
    assert_eq!(submissions.len(), 1);
    let ops = &submissions[0];
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0], ChangeOperation::AddController);
    match &ops[1] {
        ChangeOperation::AddDevice(change) => {
            assert_eq!(change.controller_key, None);
            assert_eq!(
                change.kind,
                DeviceKind::ImageBacked {
                    image_path: "[datastore1] base.flp".to_string()
                }
            );
        }
        other => panic!("expected AddDevice, got {other:?}"),
    }

    let device = api.device_of(&vm_id).expect("device created");
    assert_eq!(
        device.backing,
        BackingKind::Image {
            path: "[datastore1] base.flp".to_string()
        }
    );
}

#[tokio::test]
async fn switching_kind_edits_in_place() {
    let mut vm = FakeVm::new("web01");
    vm.controller = Some(ControllerRef {
        key: CONTROLLER_KEY,
    });
    vm.device = Some(CurrentDeviceState {
        key: DEVICE_KEY,
        backing: BackingKind::RemoteRedirect,
        allow_guest_control: true,
        start_connected: false,
        connected: false,
    });
    let api = FakeApi::with_vm(vm);
    let reconciler = Reconciler::new(api.clone());

    let outcome = reconciler
        .apply(&by_name("web01"), TargetState::Present, &client_descriptor())
        .await
        .unwrap();
    assert!(outcome.changed);

    let submissions = api.submissions();
    assert_eq!(submissions.len(), 1);
    match &submissions[0][0] {
        ChangeOperation::EditDevice { key, change } => {
            assert_eq!(*key, DEVICE_KEY);
            assert!(change.start_connected);
        }
        other => panic!("expected EditDevice, got {other:?}"),
    }

    // And the pass converged.
    let again = reconciler
        .apply(&by_name("web01"), TargetState::Present, &client_descriptor())
        .await
        .unwrap();
    assert!(!again.changed);
}

#[tokio::test]
async fn check_mode_submits_nothing() {
    let api = FakeApi::with_vm(FakeVm::new("web01"));
    let reconciler = Reconciler::with_options(
        api.clone(),
        vmfloppy::ReconcileOptions {
            dry_run: true,
            ..Default::default()
        },
    );

    let outcome = reconciler
        .apply(&by_name("web01"), TargetState::Present, &image_descriptor())
        .await
        .unwrap();
    assert!(outcome.changed);
    assert!(!outcome.failed);
    assert!(api.submissions().is_empty());
}

#[tokio::test]
async fn powered_on_vm_connects_live() {
    let mut vm = FakeVm::new("web01");
    vm.power_state = PowerState::PoweredOn;
    vm.controller = Some(ControllerRef {
        key: CONTROLLER_KEY,
    });
    let vm_id = vm.id.clone();
    let api = FakeApi::with_vm(vm);
    let reconciler = Reconciler::new(api.clone());

    let outcome = reconciler
        .apply(&by_name("web01"), TargetState::Present, &client_descriptor())
        .await
        .unwrap();
    assert!(outcome.changed);

    let device = api.device_of(&vm_id).expect("device created");
    assert!(device.connected);

    // Powered-on pass also converges.
    let again = reconciler
        .apply(&by_name("web01"), TargetState::Present, &client_descriptor())
        .await
        .unwrap();
    assert!(!again.changed);
}
