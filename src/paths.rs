//! Centralized path layout for the manager.
//!
//! All on-disk locations derive from two roots: the manager's own data
//! directory and the shared read-only server installation. The layout is an
//! owned value (not process-global) so every component and test can run
//! against its own roots.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Default data directory name under the user's home.
const DATA_DIR_NAME: &str = ".srcds_manager";

/// On-disk layout for the manager and all instance trees.
#[derive(Debug, Clone)]
pub struct Layout {
    data_dir: PathBuf,
    core_dir: PathBuf,
    game_dir: String,
    server_binary: String,
}

impl Layout {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        core_dir: impl Into<PathBuf>,
        game_dir: impl Into<String>,
        server_binary: impl Into<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            core_dir: core_dir.into(),
            game_dir: game_dir.into(),
            server_binary: server_binary.into(),
        }
    }

    /// Layout rooted at `~/.srcds_manager` for the given shared installation.
    pub fn with_default_data_dir(
        core_dir: impl Into<PathBuf>,
        game_dir: impl Into<String>,
        server_binary: impl Into<String>,
    ) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(DATA_DIR_NAME), core_dir, game_dir, server_binary)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Shared read-only server installation all instances layer over.
    pub fn core_dir(&self) -> &Path {
        &self.core_dir
    }

    /// Game content directory name, e.g. "csgo".
    pub fn game_dir_name(&self) -> &str {
        &self.game_dir
    }

    /// Server binary file name, e.g. "srcds_linux".
    pub fn server_binary_name(&self) -> &str {
        &self.server_binary
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Durable runtime state file (status and pid per instance).
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.toml")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(instance_id)
    }

    /// Game content subtree inside an instance tree.
    pub fn instance_game_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(&self.game_dir)
    }

    pub fn instance_cfg_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_game_dir(instance_id).join("cfg")
    }

    pub fn instance_maps_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_game_dir(instance_id).join("maps")
    }

    /// Directory holding workshop-imported maps.
    pub fn instance_workshop_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_maps_dir(instance_id).join("workshop")
    }

    pub fn instance_logs_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_game_dir(instance_id).join("logs")
    }

    pub fn instance_addons_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_game_dir(instance_id).join("addons")
    }

    pub fn instance_gameinfo_path(&self, instance_id: &str) -> PathBuf {
        self.instance_game_dir(instance_id).join("gameinfo.txt")
    }

    /// Private copy of the server binary inside an instance tree.
    pub fn instance_binary_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(&self.server_binary)
    }

    /// Corresponding paths in the shared installation.
    pub fn core_game_dir(&self) -> PathBuf {
        self.core_dir.join(&self.game_dir)
    }

    pub fn core_gameinfo_path(&self) -> PathBuf {
        self.core_game_dir().join("gameinfo.txt")
    }

    pub fn core_binary_path(&self) -> PathBuf {
        self.core_dir.join(&self.server_binary)
    }

    /// Directory of captured per-instance console output files.
    pub fn console_dir(&self) -> PathBuf {
        self.data_dir.join("console")
    }

    /// Append-only console output file the spawned process writes into.
    pub fn console_log_path(&self, instance_id: &str) -> PathBuf {
        self.console_dir().join(format!("{}.log", instance_id))
    }

    /// Ensure all required data directories exist.
    pub fn ensure_data_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.instances_dir(),
            self.console_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
