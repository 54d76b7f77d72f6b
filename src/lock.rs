//! File-based locking.
//!
//! Two uses: the daemon holds a non-blocking exclusive lock for its whole
//! lifetime (single writer to the firewall), and the complaint store takes a
//! blocking lock around each load-modify-save.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::ChainbanError;

/// An exclusive advisory lock, released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }

    // create+read+write without truncate: no window between create and lock
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .context("Failed to set lock file permissions")?;

    Ok(file)
}

impl LockGuard {
    /// Take the lock or fail immediately if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;

        file.try_lock_exclusive().map_err(|_| {
            ChainbanError::Configuration(format!(
                "Another instance of chainban is already running.\n\
                 If you believe this is an error, remove the lock file: {}",
                path.display()
            ))
        })?;

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Wait until the lock is available.
    pub fn wait(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chainban.lock");

        let guard = LockGuard::acquire(&path).unwrap();
        assert_eq!(guard.path(), path);
        let err = LockGuard::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(guard);
        assert!(LockGuard::acquire(&path).is_ok());
    }

    #[test]
    fn test_wait_after_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        {
            let _guard = LockGuard::wait(&path).unwrap();
            assert!(LockGuard::acquire(&path).is_err());
        }
        let _guard = LockGuard::wait(&path).unwrap();
    }

    #[test]
    fn test_lock_file_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("perm.lock");
        let _guard = LockGuard::acquire(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
