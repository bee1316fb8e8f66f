//! Periodic maintenance: console log rotation and stale-artifact sweeps.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use walkdir::WalkDir;

use crate::error::{AppError, Result};
use crate::process::Supervisor;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the hourly maintenance task. The first pass runs after one full
/// interval, not at startup.
pub fn spawn_maintenance(supervisor: Arc<Supervisor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = run_maintenance(&supervisor) {
                log::warn!("Maintenance pass failed: {}", e);
            }
        }
    })
}

/// One full maintenance pass.
pub fn run_maintenance(supervisor: &Supervisor) -> Result<()> {
    let config = supervisor.config_store().load();
    rotate_console_logs(supervisor, config.console_log_max_bytes)?;
    sweep_stale_artifacts(supervisor)?;
    for instance_id in config.instances.keys() {
        prune_dangling_links(&supervisor.layout().instance_dir(instance_id));
    }
    Ok(())
}

/// Copy-truncate rotation for oversized console logs.
///
/// The running process keeps its append-only descriptor, so the original
/// file is truncated in place rather than renamed away; the tailer detects
/// the shrink and restarts from the top.
fn rotate_console_logs(supervisor: &Supervisor, max_bytes: u64) -> Result<()> {
    let console_dir = supervisor.layout().console_dir();
    if !console_dir.is_dir() {
        return Ok(());
    }

    for entry in std::fs::read_dir(&console_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|e| e == "log") != Some(true) {
            continue;
        }
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if len <= max_bytes {
            continue;
        }

        let rotated = path.with_extension("log.1");
        if let Err(e) = rotate_one(&path, &rotated) {
            log::warn!("Failed to rotate console log {:?}: {}", path, e);
        } else {
            log::info!("Rotated console log {:?} ({} bytes)", path, len);
        }
    }
    Ok(())
}

fn rotate_one(path: &Path, rotated: &Path) -> Result<()> {
    std::fs::copy(path, rotated)
        .map_err(|e| AppError::io(format!("Failed to copy {:?} aside: {}", path, e)))?;
    std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| AppError::io(format!("Failed to truncate {:?}: {}", path, e)))?;
    Ok(())
}

/// Remove instance trees and console logs that no longer have a config entry.
fn sweep_stale_artifacts(supervisor: &Supervisor) -> Result<()> {
    let config = supervisor.config_store().load();

    let instances_dir = supervisor.layout().instances_dir();
    if instances_dir.is_dir() {
        for entry in std::fs::read_dir(&instances_dir)? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            if config.instances.contains_key(&id) || supervisor.is_running(&id) {
                continue;
            }
            log::info!("Removing stale instance tree {:?}", entry.path());
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                log::warn!("Failed to remove stale tree {:?}: {}", entry.path(), e);
            }
        }
    }

    let console_dir = supervisor.layout().console_dir();
    if console_dir.is_dir() {
        for entry in std::fs::read_dir(&console_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Strip the ".log" in "<id>.log.1" rotations.
            let id = stem.trim_end_matches(".log");
            if config.instances.contains_key(id) {
                continue;
            }
            log::info!("Removing stale console log {:?}", path);
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove stale console log {:?}: {}", path, e);
            }
        }
    }

    Ok(())
}

/// Drop symlinks whose target no longer exists, typically left behind after
/// the shared installation was updated in place.
fn prune_dangling_links(instance_dir: &Path) {
    if !instance_dir.is_dir() {
        return;
    }

    for entry in WalkDir::new(instance_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.path_is_symlink() {
            continue;
        }
        let path = entry.path();
        // `metadata` follows the link; a dead target reports NotFound.
        if std::fs::metadata(path).is_ok() {
            continue;
        }
        log::info!("Pruning dangling link {:?}", path);
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Failed to prune dangling link {:?}: {}", path, e);
        }
    }
}
