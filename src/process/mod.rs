//! Process supervision runtime.

mod control;
mod launch;
mod supervisor;
mod tail;

use std::time::Duration;

use serde::Serialize;

pub use control::{ProcessHandle, SignalKind, UnixProcessHandle};
pub use launch::{build_launch_spec, redact_args, redact_line, LaunchSpec};
pub use supervisor::Supervisor;
pub use tail::LineCallback;

/// Grace period between the graceful stop signal and the forced kill.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Delay before a freshly spawned process is confirmed online.
const ONLINE_CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// Maximum retained console lines per instance; older lines are dropped.
const LOG_RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeEventReason {
    ProcessTracked,
    Online,
    Stopped,
    Crashed,
    Adopted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEvent {
    pub instance_id: String,
    pub reason: RuntimeEventReason,
}
