//! Instance CRUD operations.

use crate::config::InstanceConfig;
use crate::error::{AppError, Result};
use crate::process::Supervisor;
use crate::validation::{validate_instance_id, validate_map_name};

use super::types::InstanceSummary;

/// Create a new instance and register it in the manager config.
///
/// The on-disk tree is not built here; provisioning happens on first start
/// and is re-verified on every start after that.
pub fn create_instance(supervisor: &Supervisor, name: &str, port: u16) -> Result<String> {
    if name.trim().is_empty() {
        return Err(AppError::config("Instance name must not be empty"));
    }

    let core_game_dir = supervisor.layout().core_game_dir();
    if !core_game_dir.is_dir() {
        return Err(AppError::config(format!(
            "Shared installation not found at {:?}",
            core_game_dir
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();

    let name = name.to_string();
    let key = id.clone();
    supervisor.config_store().with_config_mut(move |config| {
        config.instances.insert(key, InstanceConfig::new(name, port));
        Ok(())
    })?;

    std::fs::create_dir_all(supervisor.layout().instance_dir(&id))
        .map_err(|e| AppError::io(format!("Failed to create instance dir: {}", e)))?;

    Ok(id)
}

/// Delete an instance: config entry, state record, and on-disk tree.
pub fn delete_instance(supervisor: &Supervisor, instance_id: &str) -> Result<()> {
    validate_instance_id(instance_id)?;

    if supervisor.is_running(instance_id) {
        return Err(AppError::instance_running());
    }

    // Serializes against a concurrent start of the same instance.
    if !supervisor.lock_coordinator().acquire(instance_id, "delete") {
        let holder = supervisor
            .lock_coordinator()
            .holder(instance_id)
            .unwrap_or_default();
        return Err(AppError::lock_contention(instance_id, &holder));
    }

    let result = delete_locked(supervisor, instance_id);
    supervisor.lock_coordinator().release(instance_id);
    result
}

fn delete_locked(supervisor: &Supervisor, instance_id: &str) -> Result<()> {
    let id = instance_id.to_string();
    supervisor.config_store().with_config_mut(move |config| {
        config
            .instances
            .remove(&id)
            .ok_or_else(|| AppError::instance_not_found(&id))?;
        Ok(())
    })?;

    supervisor.state_store().remove(instance_id)?;
    supervisor.provisioner().destroy(instance_id)
}

/// Update an instance's name, port, or map. Changes take effect on the next
/// launch; a running process is not touched.
pub fn update_instance(
    supervisor: &Supervisor,
    instance_id: &str,
    name: Option<&str>,
    port: Option<u16>,
    map: Option<&str>,
) -> Result<()> {
    validate_instance_id(instance_id)?;
    if let Some(map) = map {
        validate_map_name(map)?;
    }

    let name_owned = name.map(|n| n.to_string());
    let map_owned = map.map(|m| m.to_string());
    let id = instance_id.to_string();
    supervisor.config_store().with_config_mut(move |config| {
        let instance = config
            .instances
            .get_mut(&id)
            .ok_or_else(|| AppError::instance_not_found(&id))?;
        if let Some(n) = name_owned {
            instance.name = n;
        }
        if let Some(p) = port {
            instance.port = p;
        }
        if let Some(m) = map_owned {
            instance.map = m;
        }
        Ok(())
    })
}

/// List all instances with their liveness-reconciled status.
pub fn list_instances(supervisor: &Supervisor) -> Vec<InstanceSummary> {
    let mut summaries = supervisor.summaries();
    for summary in &mut summaries {
        summary.status = supervisor.instance_status(&summary.id);
        if !summary.status.is_running() {
            summary.pid = None;
        }
    }
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    summaries
}
