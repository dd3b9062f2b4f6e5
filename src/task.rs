//! Task completion wait with bounded polling.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::api::{JobHandle, JobState, ManagementApi};

/// Polling parameters for [`wait_for_task`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// Maximum time to wait. `None` waits until the task is terminal.
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Terminal result of waiting on a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed(String),
    /// The deadline passed first. The task is externally owned and is left
    /// in whatever state the remote system reports; nothing is cancelled.
    TimedOut,
}

/// Poll the task until it is terminal or the deadline passes.
///
/// Suspends cooperatively between polls, so callers can run many waits on
/// one runtime and wrap this future in their own cancellation.
pub async fn wait_for_task(
    api: &dyn ManagementApi,
    task: &JobHandle,
    opts: &WaitOptions,
) -> Result<TaskOutcome> {
    let deadline = opts.timeout.map(|t| tokio::time::Instant::now() + t);

    loop {
        match api.poll_task(task).await? {
            JobState::Success => return Ok(TaskOutcome::Success),
            JobState::Error(message) => {
                warn!(task = %task.id, error = %message, "Task finished with error");
                return Ok(TaskOutcome::Failed(message));
            }
            JobState::Running => {
                debug!(task = %task.id, "Task still running");
            }
        }

        if let Some(deadline) = deadline
            && tokio::time::Instant::now() >= deadline
        {
            warn!(task = %task.id, "Timeout waiting for task");
            return Ok(TaskOutcome::TimedOut);
        }

        tokio::time::sleep(opts.poll_interval).await;
    }
}
