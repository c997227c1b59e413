//! Advisory locking for the single-writer-per-destination contract
//!
//! One lock file guards each destination root. Backup runs and the garbage
//! collector take it exclusively; restore readers take it shared so that
//! restores from one store stay independent of each other while still
//! excluding writers. A busy exclusive acquisition is rejected with
//! `BusyError` immediately, never queued.

use crate::{Result, VaultError};
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use tracing::debug;

const LOCK_FILE: &str = ".vault.lock";

/// Held advisory lock on a destination root. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: String,
}

impl StoreLock {
    /// Acquire the destination's lock exclusively (backup, GC).
    pub fn exclusive(root: &Path) -> Result<Self> {
        let (file, path) = Self::open_lock_file(root)?;
        if file.try_lock_exclusive().is_err() {
            return Err(VaultError::Busy { path });
        }
        debug!("acquired exclusive lock on {}", path);
        Ok(Self { file, path })
    }

    /// Acquire the destination's lock shared (restore readers).
    pub fn shared(root: &Path) -> Result<Self> {
        let (file, path) = Self::open_lock_file(root)?;
        if file.try_lock_shared().is_err() {
            return Err(VaultError::Busy { path });
        }
        debug!("acquired shared lock on {}", path);
        Ok(Self { file, path })
    }

    fn open_lock_file(root: &Path) -> Result<(File, String)> {
        fs::create_dir_all(root)?;
        let lock_path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        Ok((file, lock_path.display().to_string()))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!("failed to release lock on {}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_exclusive_writer_is_rejected() {
        let dir = TempDir::new().unwrap();

        let held = StoreLock::exclusive(dir.path()).unwrap();
        let second = StoreLock::exclusive(dir.path());
        assert!(matches!(second, Err(VaultError::Busy { .. })));

        drop(held);
        assert!(StoreLock::exclusive(dir.path()).is_ok());
    }

    #[test]
    fn test_shared_readers_coexist_but_exclude_writers() {
        let dir = TempDir::new().unwrap();

        let first = StoreLock::shared(dir.path()).unwrap();
        let second = StoreLock::shared(dir.path()).unwrap();
        assert!(matches!(
            StoreLock::exclusive(dir.path()),
            Err(VaultError::Busy { .. })
        ));

        drop(first);
        drop(second);
        assert!(StoreLock::exclusive(dir.path()).is_ok());
    }
}
