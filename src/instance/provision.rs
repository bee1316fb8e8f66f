//! Layered instance tree construction and verification.
//!
//! An instance tree reuses the shared installation through links and owns a
//! small private slice: configuration, maps, logs, addons, the patched
//! `gameinfo.txt` and the server binary itself. Construction is idempotent
//! and doubles as repair; verification runs before every launch and triggers
//! a full rebuild when the tree is stale, so provisioning self-heals after
//! partial failures, manual tampering or upgrades of the shared installation.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::InstanceConfig;
use crate::error::{AppError, Result};
use crate::layering::{is_real_dir, LayeredFilesystem};
use crate::paths::Layout;

/// Marker proving the mod loader search path is present in gameinfo.txt.
const MOD_LOADER_MARKER: &str = "addons/metamod";

/// Entries of the game content subtree that stay private to the instance.
const CONTENT_EXCLUSIONS: [&str; 6] = ["cfg", "maps", "logs", "addons", "bin", "gameinfo.txt"];

/// Builds and repairs per-instance layered trees.
pub struct Provisioner {
    layout: Layout,
    layering: Arc<dyn LayeredFilesystem>,
}

impl Provisioner {
    pub fn new(layout: Layout, layering: Arc<dyn LayeredFilesystem>) -> Self {
        Self { layout, layering }
    }

    /// Verify the tree and rebuild it if anything is stale. Called
    /// unconditionally before every launch.
    pub fn ensure_ready(&self, instance_id: &str, config: &InstanceConfig) -> Result<()> {
        if self.verify(instance_id) {
            return Ok(());
        }

        log::info!(
            "Instance {} tree is missing or stale, provisioning",
            instance_id
        );
        self.prepare(instance_id, config)?;

        if !self.verify(instance_id) {
            return Err(AppError::provisioning(format!(
                "instance {} tree still fails verification after rebuild",
                instance_id
            )));
        }
        Ok(())
    }

    /// Full construction pass. Safe to call repeatedly; existing correct
    /// links and private files are kept.
    pub fn prepare(&self, instance_id: &str, config: &InstanceConfig) -> Result<()> {
        self.build_tree(instance_id, config)
            .map_err(|e| AppError::provisioning(e.to_string()))
    }

    fn build_tree(&self, instance_id: &str, config: &InstanceConfig) -> Result<()> {
        let core_dir = self.layout.core_dir();
        if !core_dir.is_dir() {
            return Err(AppError::io(format!(
                "shared installation not found at {core_dir:?}"
            )));
        }

        // Private subtree skeleton.
        for dir in [
            self.layout.instance_dir(instance_id),
            self.layout.instance_cfg_dir(instance_id),
            self.layout.instance_maps_dir(instance_id),
            self.layout.instance_workshop_dir(instance_id),
            self.layout.instance_logs_dir(instance_id),
            self.layout.instance_addons_dir(instance_id),
        ] {
            fs::create_dir_all(&dir)?;
        }

        self.link_root_entries(instance_id)?;
        self.link_content_entries(instance_id)?;
        self.link_dir_entries(
            &self.layout.core_game_dir().join("bin"),
            &self.layout.instance_game_dir(instance_id).join("bin"),
            &[],
        )?;
        self.seed_cfg(instance_id, config)?;
        self.seed_maps(instance_id)?;
        self.materialize_gameinfo(instance_id)?;

        // Some runtime environments need a binary path that is not inside the
        // shared installation root; everything the binary loads stays linked.
        self.layering.materialize(
            &self.layout.core_binary_path(),
            &self.layout.instance_binary_path(instance_id),
        )?;

        Ok(())
    }

    /// Link every top-level shared asset into the instance root. The game
    /// content dir, the engine `bin` dir and the server binary get special
    /// handling elsewhere.
    fn link_root_entries(&self, instance_id: &str) -> Result<()> {
        let skip = [
            self.layout.game_dir_name().to_string(),
            self.layout.server_binary_name().to_string(),
            "bin".to_string(),
        ];
        self.link_dir_entries(
            self.layout.core_dir(),
            &self.layout.instance_dir(instance_id),
            &skip,
        )?;

        // Engine binaries live in a real dir of links so the directory itself
        // stays writable for runtime droppings.
        self.link_dir_entries(
            &self.layout.core_dir().join("bin"),
            &self.layout.instance_dir(instance_id).join("bin"),
            &[],
        )
    }

    /// Link the game content subtree, leaving the private exclusion set as
    /// real directories and files.
    fn link_content_entries(&self, instance_id: &str) -> Result<()> {
        let skip: Vec<String> = CONTENT_EXCLUSIONS.iter().map(|s| s.to_string()).collect();
        self.link_dir_entries(
            &self.layout.core_game_dir(),
            &self.layout.instance_game_dir(instance_id),
            &skip,
        )
    }

    fn link_dir_entries(&self, source: &Path, dest: &Path, skip: &[String]) -> Result<()> {
        if !source.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(dest)?;

        for entry in fs::read_dir(source)? {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if skip.iter().any(|s| s.as_str() == name_str) {
                continue;
            }
            self.layering.link(&entry.path(), &dest.join(&name))?;
        }
        Ok(())
    }

    /// Shared config files are linked; `server.cfg` is a private seed the
    /// instance owner edits.
    fn seed_cfg(&self, instance_id: &str, config: &InstanceConfig) -> Result<()> {
        self.link_dir_entries(
            &self.layout.core_game_dir().join("cfg"),
            &self.layout.instance_cfg_dir(instance_id),
            &["server.cfg".to_string()],
        )?;

        let server_cfg = self.layout.instance_cfg_dir(instance_id).join("server.cfg");
        if !server_cfg.exists() {
            let content = format!(
                "hostname \"{}\"\nsv_lan 0\nlog on\nsv_logfile 1\nexec banned_user.cfg\nexec banned_ip.cfg\n",
                config.name
            );
            fs::write(&server_cfg, content)?;
        }
        Ok(())
    }

    /// Stock maps are linked into the private maps dir; custom and workshop
    /// maps land next to them as real files.
    fn seed_maps(&self, instance_id: &str) -> Result<()> {
        self.link_dir_entries(
            &self.layout.core_game_dir().join("maps"),
            &self.layout.instance_maps_dir(instance_id),
            &["workshop".to_string()],
        )
    }

    fn materialize_gameinfo(&self, instance_id: &str) -> Result<()> {
        let dest = self.layout.instance_gameinfo_path(instance_id);
        self.layering
            .materialize(&self.layout.core_gameinfo_path(), &dest)?;
        patch_gameinfo(&dest, self.layout.game_dir_name())
    }

    /// Pre-launch integrity check. Returns `false` on the first failed check.
    pub fn verify(&self, instance_id: &str) -> bool {
        let checks: [(&str, bool); 6] = [
            (
                "engine binary dir",
                is_real_dir(&self.layout.instance_dir(instance_id).join("bin")),
            ),
            (
                "content binary dir",
                is_real_dir(&self.layout.instance_game_dir(instance_id).join("bin")),
            ),
            (
                "workshop dir",
                self.layout.instance_workshop_dir(instance_id).is_dir(),
            ),
            (
                "maps present",
                dir_entry_count(&self.layout.instance_maps_dir(instance_id)) > 0,
            ),
            (
                "cfg populated",
                dir_entry_count(&self.layout.instance_cfg_dir(instance_id)) > 1,
            ),
            (
                "mod loader directive",
                gameinfo_has_directive(&self.layout.instance_gameinfo_path(instance_id)),
            ),
        ];

        for (name, ok) in checks {
            if !ok {
                log::warn!(
                    "Instance {} failed tree verification: {}",
                    instance_id,
                    name
                );
                return false;
            }
        }
        true
    }

    /// Remove an instance tree entirely.
    pub fn destroy(&self, instance_id: &str) -> Result<()> {
        let dir = self.layout.instance_dir(instance_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let console_log = self.layout.console_log_path(instance_id);
        if console_log.exists() {
            if let Err(e) = fs::remove_file(&console_log) {
                log::warn!("Failed to remove console log {:?}: {}", console_log, e);
            }
        }
        Ok(())
    }
}

fn dir_entry_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

fn gameinfo_has_directive(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|content| content.contains(MOD_LOADER_MARKER))
        .unwrap_or(false)
}

/// Insert the mod loader search path into a private gameinfo.txt. Skips the
/// write when the directive is already present.
pub fn patch_gameinfo(path: &Path, game_dir: &str) -> Result<()> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::io(format!("failed to read {path:?}: {e}")))?;
    if content.contains(MOD_LOADER_MARKER) {
        return Ok(());
    }

    let directive = format!("{}/addons/metamod", game_dir);
    let mut lines: Vec<String> = Vec::new();
    let mut inserted = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if !inserted && trimmed.starts_with("Game") && !trimmed.starts_with("GameInfo") {
            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
            // The mod loader path must be searched before the stock game dirs.
            lines.push(format!("{indent}Game\t{directive}"));
            inserted = true;
        }
        lines.push(line.to_string());
    }

    if !inserted {
        lines.push(format!("Game\t{directive}"));
    }

    fs::write(path, lines.join("\n") + "\n")
        .map_err(|e| AppError::io(format!("failed to write {path:?}: {e}")))?;
    Ok(())
}
