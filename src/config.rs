use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Persistent manager configuration backed by a TOML file.
///
/// Reads go through an in-memory cache; mutations take the store lock and
/// perform a read-modify-write so concurrent updates cannot lose data.
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
    cache: RwLock<Arc<ManagerConfig>>,
}

impl ConfigStore {
    /// Open the config file, creating it with defaults if missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            let config = ManagerConfig::default();
            save_to_disk(&path, &config)?;
            config
        };

        Ok(Self {
            path,
            lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(config)),
        })
    }

    pub fn load(&self) -> Arc<ManagerConfig> {
        let config = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&config)
    }

    /// Execute a read-modify-write operation while holding the store lock.
    pub fn with_config_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ManagerConfig) -> Result<T>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = {
            let config = self.cache.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&config)
        };

        let mut updated = (*current).clone();
        let result = f(&mut updated)?;
        save_to_disk(&self.path, &updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

        Ok(result)
    }
}

fn save_to_disk(path: &Path, config: &ManagerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Shared read-only server installation all instances layer over.
    #[serde(default)]
    pub core_dir: PathBuf,
    /// Game content directory name inside the installation.
    #[serde(default = "default_game_dir")]
    pub game_dir: String,
    /// Server binary file name at the installation root.
    #[serde(default = "default_server_binary")]
    pub server_binary: String,
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,
    /// Console log files larger than this are rotated by maintenance.
    #[serde(default = "default_console_log_max_bytes")]
    pub console_log_max_bytes: u64,
}

fn default_game_dir() -> String {
    "csgo".to_string()
}

fn default_server_binary() -> String {
    "srcds_linux".to_string()
}

fn default_console_log_max_bytes() -> u64 {
    8 * 1024 * 1024
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            core_dir: PathBuf::new(),
            game_dir: default_game_dir(),
            server_binary: default_server_binary(),
            instances: HashMap::new(),
            console_log_max_bytes: default_console_log_max_bytes(),
        }
    }
}

/// Declared configuration for one server instance.
///
/// Created by the API layer; the runtime core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    /// 0 means "pick any free port at launch".
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_map")]
    pub map: String,
    /// Workshop map id; when set it wins over `map`.
    #[serde(default)]
    pub workshop_map: Option<String>,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
    #[serde(default)]
    pub sv_password: Option<String>,
    #[serde(default)]
    pub rcon_password: Option<String>,
    /// Game server login token.
    #[serde(default)]
    pub gslt_token: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_true")]
    pub hibernate_when_empty: bool,
    #[serde(default)]
    pub sourcetv: bool,
    #[serde(default)]
    pub tv_port: Option<u16>,
    /// Scheduling priority delta; NaN/infinite values mean "no adjustment".
    #[serde(default)]
    pub cpu_priority: Option<f64>,
    /// Virtual memory ceiling in MiB; NaN/infinite values mean "no limit".
    #[serde(default)]
    pub memory_limit_mb: Option<f64>,
    /// Free-form extra launch arguments, passed through verbatim.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub created_at: String,
}

fn default_map() -> String {
    "de_dust2".to_string()
}

fn default_max_players() -> u32 {
    16
}

fn default_tick_rate() -> u32 {
    64
}

fn default_true() -> bool {
    true
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            map: default_map(),
            workshop_map: None,
            max_players: default_max_players(),
            tick_rate: default_tick_rate(),
            sv_password: None,
            rcon_password: None,
            gslt_token: None,
            insecure: false,
            hibernate_when_empty: true,
            sourcetv: false,
            tv_port: None,
            cpu_priority: None,
            memory_limit_mb: None,
            extra_args: Vec::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Secret values that must never reach a log line or buffer.
    pub fn secrets(&self) -> Vec<String> {
        [&self.sv_password, &self.rcon_password, &self.gslt_token]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigStore, InstanceConfig};

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let store = ConfigStore::open(&path).unwrap();
        store
            .with_config_mut(|config| {
                config
                    .instances
                    .insert("a".to_string(), InstanceConfig::new("main", 27015));
                Ok(())
            })
            .unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        let config = reopened.load();
        assert_eq!(config.instances["a"].port, 27015);
        assert_eq!(config.instances["a"].map, "de_dust2");
        assert!(config.instances["a"].hibernate_when_empty);
    }

    #[test]
    fn secrets_skip_missing_and_empty() {
        let mut config = InstanceConfig::new("x", 0);
        config.sv_password = Some("join-secret".to_string());
        config.rcon_password = Some(String::new());
        assert_eq!(config.secrets(), vec!["join-secret".to_string()]);
    }
}
