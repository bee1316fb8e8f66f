//! Filesystem layering primitives.
//!
//! Instance trees reuse the shared installation by linking unmodified files
//! and materializing only the paths an instance must own privately. The
//! mechanism is behind a trait so a platform without symbolic links can
//! substitute a copy- or overlay-based strategy without touching the
//! provisioner or supervisor.

use std::fs;
use std::path::Path;

use crate::error::{AppError, Result};

pub trait LayeredFilesystem: Send + Sync {
    /// Make `link_path` point at `target`. Idempotent: an existing correct
    /// link is kept, anything else at that path is replaced.
    fn link(&self, target: &Path, link_path: &Path) -> Result<()>;

    /// Produce a private writable copy of `source` at `dest`. An existing
    /// regular file at `dest` is kept as-is.
    fn materialize(&self, source: &Path, dest: &Path) -> Result<()>;

    /// Whether `path` is a link resolving to `target`.
    fn verify_link(&self, path: &Path, target: &Path) -> bool;
}

/// Symbolic-link layering for Unix hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymlinkLayering;

impl LayeredFilesystem for SymlinkLayering {
    fn link(&self, target: &Path, link_path: &Path) -> Result<()> {
        if self.verify_link(link_path, target) {
            return Ok(());
        }

        if let Ok(meta) = fs::symlink_metadata(link_path) {
            // Stale link or a leftover real entry from a broken tree.
            if meta.is_dir() {
                fs::remove_dir_all(link_path)?;
            } else {
                fs::remove_file(link_path)?;
            }
        }

        let parent = link_path
            .parent()
            .ok_or_else(|| AppError::io("link path has no parent directory"))?;
        fs::create_dir_all(parent)?;
        create_symlink(target, link_path)
    }

    fn materialize(&self, source: &Path, dest: &Path) -> Result<()> {
        if let Ok(meta) = fs::symlink_metadata(dest) {
            if meta.is_file() && !meta.is_symlink() {
                return Ok(());
            }
            if meta.is_dir() {
                fs::remove_dir_all(dest)?;
            } else {
                fs::remove_file(dest)?;
            }
        }

        let parent = dest
            .parent()
            .ok_or_else(|| AppError::io("destination has no parent directory"))?;
        fs::create_dir_all(parent)?;
        fs::copy(source, dest)
            .map_err(|e| AppError::io(format!("failed to copy {source:?} to {dest:?}: {e}")))?;
        Ok(())
    }

    fn verify_link(&self, path: &Path, target: &Path) -> bool {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_symlink() => fs::read_link(path)
                .map(|existing| existing == target)
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, link_path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link_path)
        .map_err(|e| AppError::io(format!("failed to create symlink at {link_path:?}: {e}")))
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, _link_path: &Path) -> Result<()> {
    Err(AppError::io("symlink creation not supported on this platform"))
}

/// True for a real (non-link) directory; used by tree verification.
pub fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.is_dir() && !meta.is_symlink())
        .unwrap_or(false)
}
