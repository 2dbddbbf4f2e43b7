//! Advisory lock coordinating one builder against any number of searchers.
//!
//! The lock lives in a dedicated file next to the container. A build holds it
//! exclusively from before the first write until the new container is in
//! place; every search holds it shared while its reader is open. The lock is
//! a convention between codedb processes only, nothing stops an unrelated
//! process from touching the container.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// RAII advisory lock; released when dropped.
///
/// Acquisition blocks until the lock is available. There is no timeout.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    mode: LockMode,
}

impl FileLock {
    /// Blocks until the exclusive (build) lock is held
    pub fn lock_exclusive(lock_path: &Path) -> io::Result<Self> {
        Self::acquire(lock_path, LockMode::Exclusive)
    }

    /// Blocks until a shared (search) lock is held
    pub fn lock_sharable(lock_path: &Path) -> io::Result<Self> {
        Self::acquire(lock_path, LockMode::Shared)
    }

    pub fn acquire(lock_path: &Path, mode: LockMode) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        match mode {
            LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
            LockMode::Shared => FileExt::lock_shared(&file)?,
        }
        trace!("Acquired {:?} lock on {}", mode, lock_path.display());

        Ok(Self { file, mode })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_creates_lock_file() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("lock");

        let lock = FileLock::lock_sharable(&lock_path).unwrap();
        assert!(lock_path.exists());
        assert_eq!(lock.mode(), LockMode::Shared);
    }

    #[test]
    fn test_shared_locks_coexist() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("lock");

        let _first = FileLock::lock_sharable(&lock_path).unwrap();
        let second = FileLock::lock_sharable(&lock_path).unwrap();
        assert_eq!(second.mode(), LockMode::Shared);
    }

    #[test]
    fn test_exclusive_waits_for_shared() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("lock");

        let shared = FileLock::lock_sharable(&lock_path).unwrap();

        let (tx, rx) = mpsc::channel();
        let path = lock_path.clone();
        let handle = thread::spawn(move || {
            let _lock = FileLock::lock_exclusive(&path).unwrap();
            tx.send(()).unwrap();
        });

        // The writer must still be blocked while the reader holds its lock
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        drop(shared);
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        handle.join().unwrap();
    }
}
