//! Scratch workspace for one pipeline run.
//!
//! The workspace owns the temporary directory tree that holds extracted ISO
//! contents, unpacked WIM images, and the staged output image. It is
//! exclusively owned by one run: an `fs2` lock file guards against two
//! pipelines ever sharing a scratch tree, and the whole tree is deleted when
//! the workspace drops, on every exit path.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct BuildWorkspace {
    dir: TempDir,
    // Held for the lifetime of the workspace; unlocked on drop.
    _lock: File,
}

impl BuildWorkspace {
    /// Create a fresh workspace under the system temp directory.
    pub fn create() -> Result<Self> {
        let dir = TempDir::with_prefix("bootcamp-patcher-")
            .context("creating scratch workspace directory")?;

        let lock_path = dir.path().join(".lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("creating workspace lock '{}'", lock_path.display()))?;
        lock.try_lock_exclusive()
            .with_context(|| format!("locking workspace '{}'", dir.path().display()))?;

        Ok(Self { dir, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create (if needed) and return a named subdirectory.
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating workspace subdirectory '{}'", path.display()))?;
        Ok(path)
    }

    /// Path for a scratch file directly under the workspace root.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_deleted_on_drop() {
        let ws = BuildWorkspace::create().unwrap();
        let root = ws.path().to_path_buf();
        ws.subdir("target").unwrap();
        assert!(root.join("target").exists());

        drop(ws);
        assert!(!root.exists());
    }

    #[test]
    fn subdir_is_idempotent() {
        let ws = BuildWorkspace::create().unwrap();
        let a = ws.subdir("x").unwrap();
        let b = ws.subdir("x").unwrap();
        assert_eq!(a, b);
    }
}
