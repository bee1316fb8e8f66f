//! Per-instance operation leases.
//!
//! Exactly one lifecycle operation (start/stop/provision) may run against a
//! given instance at a time. Acquisition is fail-fast: a second caller gets
//! `false` instead of queueing. Operations on different instances never
//! contend beyond the map lock itself.

use std::collections::HashMap;
use std::sync::Mutex;

/// Grants and revokes exclusive per-instance leases.
#[derive(Debug, Default)]
pub struct LockCoordinator {
    leases: Mutex<HashMap<String, String>>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lease for `instance_id`. Returns `false` if another
    /// operation already holds it.
    pub fn acquire(&self, instance_id: &str, purpose: &str) -> bool {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.contains_key(instance_id) {
            return false;
        }
        leases.insert(instance_id.to_string(), purpose.to_string());
        true
    }

    /// Release the lease. Releasing an unheld lease is a no-op.
    pub fn release(&self, instance_id: &str) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.remove(instance_id);
    }

    /// Drop a lease left over from a previous controller lifetime.
    pub fn force_release(&self, instance_id: &str) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(purpose) = leases.remove(instance_id) {
            log::warn!(
                "Force-released stale lease for instance {} (held for {})",
                instance_id,
                purpose
            );
        }
    }

    /// Current lease holder, if any.
    pub fn holder(&self, instance_id: &str) -> Option<String> {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.get(instance_id).cloned()
    }
}
