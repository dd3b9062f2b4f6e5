//! vmfloppy: declarative floppy-drive management for virtual machines.
//!
//! Thin CLI over the reconciliation engine. Prints the outcome as JSON on
//! stdout; exits 0 iff the pass did not fail.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmfloppy::{
    DeviceDescriptor, DeviceKind, HttpManagementApi, NameMatch, ReconcileError, ReconcileOptions,
    ReconcileOutcome, Reconciler, TargetState, VmSelector, WaitOptions,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NameMatchArg {
    First,
    Last,
}

impl From<NameMatchArg> for NameMatch {
    fn from(v: NameMatchArg) -> Self {
        match v {
            NameMatchArg::First => NameMatch::First,
            NameMatchArg::Last => NameMatch::Last,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Present,
    Absent,
}

impl From<StateArg> for TargetState {
    fn from(v: StateArg) -> Self {
        match v {
            StateArg::Present => TargetState::Present,
            StateArg::Absent => TargetState::Absent,
        }
    }
}

/// Reconcile a VM's floppy drive with the declared configuration
#[derive(Parser, Debug)]
#[command(name = "vmfloppy", version, about)]
struct Args {
    /// Management API unix socket
    #[arg(long, default_value = "/run/vmm/api.sock")]
    socket: PathBuf,

    /// Name of the VM (required unless --uuid is given)
    #[arg(long)]
    name: Option<String>,

    /// Unique id of the VM
    #[arg(long)]
    uuid: Option<String>,

    /// Which VM to pick when the name matches more than one
    #[arg(long, value_enum, default_value_t = NameMatchArg::First)]
    name_match: NameMatchArg,

    /// Desired state of the floppy drive
    #[arg(long, value_enum, default_value_t = StateArg::Present)]
    state: StateArg,

    /// Floppy kind: none (present but disconnected), client, or image
    #[arg(long, default_value = "none")]
    kind: String,

    /// Datastore path to the image, e.g. "[datastore1] base.flp"
    #[arg(long)]
    image_file: Option<String>,

    /// Connect the drive at the next power-on
    #[arg(long)]
    start_connected: bool,

    /// Compute and report the change-set without submitting it
    #[arg(long)]
    check: bool,

    /// Task poll interval in seconds
    #[arg(long, default_value = "1")]
    poll_interval_secs: u64,

    /// Maximum seconds to wait for the reconfigure task (0 = no limit)
    #[arg(long, default_value = "600")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vmfloppy=info,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(outcome) => {
            match serde_json::to_string_pretty(&outcome) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("failed to encode outcome: {e}"),
            }
            if outcome.failed {
                if let Some(message) = &outcome.message {
                    eprintln!("{message}");
                }
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<ReconcileOutcome, ReconcileError> {
    let selector = match (args.name, args.uuid) {
        (_, Some(uuid)) => VmSelector::Uuid(uuid),
        (Some(name), None) => VmSelector::Name {
            name,
            name_match: args.name_match.into(),
        },
        (None, None) => {
            return Err(ReconcileError::Validation(
                "one of --name or --uuid is required".to_string(),
            ));
        }
    };

    let kind = DeviceKind::parse(&args.kind, args.image_file.as_deref())?;
    let desired = DeviceDescriptor::new(kind, args.start_connected);

    let wait = WaitOptions {
        poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
        timeout: (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs)),
    };

    let api = Arc::new(HttpManagementApi::new(&args.socket));
    let reconciler = Reconciler::with_options(
        api,
        ReconcileOptions {
            wait,
            dry_run: args.check,
        },
    );

    reconciler
        .apply(&selector, args.state.into(), &desired)
        .await
}
