//! Instance-related type definitions.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an instance.
///
/// `Online` always implies a recorded pid; status checks reconcile an
/// `Online` entry whose process died to `Offline` or `Crashed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Offline,
    Starting,
    Online,
    Crashed,
}

impl InstanceStatus {
    /// Whether the state store considers this instance to have a live process.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Online)
    }
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Offline
    }
}

/// Durable runtime record for one instance, persisted by the state store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<String>,
}

/// Status summary exposed to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub port: u16,
    pub map: String,
}
