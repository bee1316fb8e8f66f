//! Durable instance state store.
//!
//! One TOML file maps instance id to (status, pid, start timestamp). It is
//! the single source of truth consulted at supervisor startup to find
//! processes that may have outlived the previous controller.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::instance::{InstanceRecord, InstanceStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    instances: HashMap<String, InstanceRecord>,
}

pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
    cache: RwLock<StateFile>,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            StateFile::default()
        };

        Ok(Self {
            path,
            lock: Mutex::new(()),
            cache: RwLock::new(state),
        })
    }

    pub fn get(&self, instance_id: &str) -> Option<InstanceRecord> {
        let state = self.cache.read().unwrap_or_else(|e| e.into_inner());
        state.instances.get(instance_id).cloned()
    }

    /// Instances the store believes have a live process.
    pub fn running_entries(&self) -> Vec<(String, InstanceRecord)> {
        let state = self.cache.read().unwrap_or_else(|e| e.into_inner());
        state
            .instances
            .iter()
            .filter(|(_, record)| record.status.is_running())
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Record a spawned process.
    pub fn mark_started(&self, instance_id: &str, pid: u32) -> Result<()> {
        self.update(instance_id, |record| {
            record.status = InstanceStatus::Starting;
            record.pid = Some(pid);
            record.started_at = Some(chrono::Utc::now().to_rfc3339());
        })
    }

    /// Transition to a terminal or confirmed status. `Offline` and `Crashed`
    /// clear the recorded pid.
    pub fn set_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()> {
        self.update(instance_id, |record| {
            record.status = status;
            if !status.is_running() {
                record.pid = None;
                record.started_at = None;
            }
        })
    }

    pub fn remove(&self, instance_id: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.cache.write().unwrap_or_else(|e| e.into_inner());
        state.instances.remove(instance_id);
        save_to_disk(&self.path, &state)
    }

    fn update<F>(&self, instance_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let record = state.instances.entry(instance_id.to_string()).or_default();
        f(record);
        save_to_disk(&self.path, &state)
    }
}

fn save_to_disk(path: &Path, state: &StateFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(state)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::StateStore;
    use crate::instance::InstanceStatus;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");

        let store = StateStore::open(&path).unwrap();
        store.mark_started("a", 4242).unwrap();
        store.set_status("a", InstanceStatus::Online).unwrap();

        let reopened = StateStore::open(&path).unwrap();
        let record = reopened.get("a").unwrap();
        assert_eq!(record.status, InstanceStatus::Online);
        assert_eq!(record.pid, Some(4242));
        assert_eq!(reopened.running_entries().len(), 1);
    }

    #[test]
    fn offline_clears_pid() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.toml")).unwrap();
        store.mark_started("a", 99).unwrap();
        store.set_status("a", InstanceStatus::Offline).unwrap();

        let record = store.get("a").unwrap();
        assert_eq!(record.status, InstanceStatus::Offline);
        assert_eq!(record.pid, None);
        assert!(store.running_entries().is_empty());
    }
}
