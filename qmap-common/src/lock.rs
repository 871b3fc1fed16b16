//! Exclusive run lock backed by a lock file
//!
//! The lock file is created with `create_new`, so exactly one process can
//! hold it. It is removed when the guard drops. A crashed run leaves the
//! file behind; an operator removes it after confirming nothing is running.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Identity of the lock holder, written into the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub host: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} on {} since {}",
            self.pid,
            self.host.as_deref().unwrap_or("unknown host"),
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Guard for an acquired run lock
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    holder: LockHolder,
}

impl RunLock {
    /// Acquire the lock or fail fast with [`Error::Locked`]
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::acquire_with(path, write_holder)
    }

    fn acquire_with<F>(path: &Path, write: F) -> Result<Self>
    where
        F: FnOnce(&mut File, &LockHolder) -> Result<()>,
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let holder = LockHolder {
            pid: std::process::id(),
            host: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
            acquired_at: Utc::now(),
        };

        let mut file = match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = std::fs::read_to_string(path).unwrap_or_default();
                let holder = serde_json::from_str::<LockHolder>(&existing)
                    .map(|h| h.to_string())
                    .unwrap_or_else(|_| "unreadable lock file".to_string());
                return Err(Error::Locked {
                    path: path.to_path_buf(),
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };

        // No guard yet; Drop will not clean up
        if let Err(e) = write(&mut file, &holder) {
            drop(file);
            let _ = std::fs::remove_file(path);
            return Err(e);
        }

        tracing::debug!(lock = %path.display(), holder = %holder, "Run lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            holder,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

fn write_holder(file: &mut File, holder: &LockHolder) -> Result<()> {
    let body = serde_json::to_string(holder)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(lock = %self.path.display(), "Run lock released"),
            Err(e) => tracing::warn!(
                lock = %self.path.display(),
                error = %e,
                "Failed to remove run lock file"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.toml.lock");

        let first = RunLock::acquire(&path).unwrap();
        let second = RunLock::acquire(&path);

        match second {
            Err(Error::Locked { path: locked, holder }) => {
                assert_eq!(locked, path);
                assert!(holder.contains(&first.holder().pid.to_string()));
            }
            other => panic!("expected Locked, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.toml.lock");

        {
            let _lock = RunLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());

        // Can be re-acquired after release
        let again = RunLock::acquire(&path);
        assert!(again.is_ok());
    }

    #[test]
    fn test_stale_garbage_lock_still_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.toml.lock");
        std::fs::write(&path, "not json").unwrap();

        match RunLock::acquire(&path) {
            Err(Error::Locked { holder, .. }) => assert_eq!(holder, "unreadable lock file"),
            other => panic!("expected Locked, got {:?}", other),
        }
        // Foreign lock file is left in place
        assert!(path.exists());
    }

    #[test]
    fn test_failed_holder_write_removes_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.toml.lock");

        let result = RunLock::acquire_with(&path, |file, _| {
            file.write_all(b"{\"pid\":")?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
        });
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!path.exists());

        // Next run is not blocked
        let lock = RunLock::acquire(&path).unwrap();
        assert_eq!(lock.holder().pid, std::process::id());
    }
}
