//! Manager for many isolated srcds instances over one shared installation.
//!
//! Each instance runs from its own layered tree: symlinks into the shared
//! read-only installation for the bulk of the content, plus a small private
//! slice (cfg, maps/workshop, logs, addons, gameinfo.txt) the instance owns.
//! The [`Supervisor`] is the entry point: it provisions trees, spawns and
//! stops processes, classifies exits, and adopts orphans left over from a
//! previous controller lifetime.

mod config;
mod error;
mod instance;
mod layering;
mod lock;
mod paths;
mod process;
mod state;
mod validation;

pub use config::{ConfigStore, InstanceConfig, ManagerConfig};
pub use error::{AppError, ErrorKind, Result};
pub use instance::{
    create_instance, delete_instance, list_instances, patch_gameinfo, run_maintenance,
    spawn_maintenance, update_instance, InstanceRecord, InstanceStatus, InstanceSummary,
    Provisioner,
};
pub use layering::{LayeredFilesystem, SymlinkLayering};
pub use lock::LockCoordinator;
pub use paths::Layout;
pub use process::{
    build_launch_spec, redact_args, redact_line, LaunchSpec, LineCallback, ProcessHandle,
    RuntimeEvent, RuntimeEventReason, SignalKind, Supervisor, UnixProcessHandle,
};
pub use state::StateStore;
