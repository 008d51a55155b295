//! Build workspace: lock file, producer staging areas, run records and
//! default output location.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{AssemblyError, Result};

const LOCK_FILENAME: &str = ".lock";
const APP_DIR: &str = "sandbox-assembler";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating if needed) a workspace rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let workspace = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(workspace.staging_dir())?;
        fs::create_dir_all(workspace.runs_dir())?;
        fs::create_dir_all(workspace.out_dir())?;
        Ok(workspace)
    }

    /// `<cache dir>/sandbox-assembler`, falling back to `./.sandbox-assembler`.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(format!(".{APP_DIR}")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    /// Default target for a pipeline when none is given.
    pub fn default_target(&self, pipeline: &str) -> PathBuf {
        self.out_dir().join(pipeline).join("rootfs")
    }

    /// Take the workspace lock; fails fast if another build holds it.
    pub fn lock(&self) -> Result<WorkspaceLock> {
        let path = self.root.join(LOCK_FILENAME);
        // The lock file is never unlinked: removing a still-locked file would
        // let a second process lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(AssemblyError::Locked {
                path: path.display().to_string(),
            });
        }
        Ok(WorkspaceLock { file, path })
    }
}

/// Held for the duration of a build; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_layout() {
        let temp = TempDir::new().unwrap();
        let workspace = Workspace::open(&temp.path().join("ws")).unwrap();
        assert!(workspace.staging_dir().is_dir());
        assert!(workspace.runs_dir().is_dir());
        assert_eq!(
            workspace.default_target("sandbox"),
            temp.path().join("ws/out/sandbox/rootfs")
        );
    }

    #[test]
    fn second_lock_fails_until_first_is_dropped() {
        let temp = TempDir::new().unwrap();
        let workspace = Workspace::open(temp.path()).unwrap();

        let first = workspace.lock().unwrap();
        let err = workspace.lock().unwrap_err();
        assert!(matches!(err, AssemblyError::Locked { .. }), "{err}");

        drop(first);
        assert!(workspace.lock().is_ok());
    }
}
