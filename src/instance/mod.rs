//! Instance management.
//!
//! On-disk layout per instance:
//! - instances/{id}/ - the layered server tree the process runs from
//! - instances/{id}/{game_dir}/cfg/ - private config slice (real files)
//! - instances/{id}/{game_dir}/maps/workshop/ - private workshop downloads
//! - data/console/{id}.log - captured process output

mod cleanup;
mod crud;
mod provision;
mod types;

pub use types::{InstanceRecord, InstanceStatus, InstanceSummary};

pub use crud::{create_instance, delete_instance, list_instances, update_instance};

pub use provision::{patch_gameinfo, Provisioner};

pub use cleanup::{run_maintenance, spawn_maintenance};
