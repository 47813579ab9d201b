//! Advisory cross-process store locks.
//!
//! A lock is a directory under `<storeRoot>/locks/` — `mkdir` is atomic on
//! every platform we care about, so whoever creates it owns the store.
//! The guard removes the directory on drop, which runs on every exit path
//! including unwinds.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

use skygent_core::ids::StoreName;

use crate::errors::{Result, StoreError};
use crate::paths::StoreRoot;

/// Poll interval for [`StoreLock::acquire_wait`].
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Held advisory lock. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    dir: PathBuf,
    name: StoreName,
}

impl StoreLock {
    /// Try to take the lock once.
    pub fn acquire(root: &StoreRoot, name: &StoreName) -> Result<Self> {
        let locks_dir = root.locks_dir();
        std::fs::create_dir_all(&locks_dir).map_err(|e| StoreError::io(&locks_dir, e))?;
        let dir = root.lock_dir(name);
        match std::fs::create_dir(&dir) {
            Ok(()) => {
                debug!(store = %name, "store lock acquired");
                Ok(Self {
                    dir,
                    name: name.clone(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::Locked {
                    name: name.clone(),
                    message: "another process holds the lock".into(),
                })
            }
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    /// Take the lock, polling every 250 ms for up to `wait_for`.
    pub fn acquire_wait(root: &StoreRoot, name: &StoreName, wait_for: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait_for;
        loop {
            match Self::acquire(root, name) {
                Ok(lock) => return Ok(lock),
                Err(StoreError::Locked { .. }) if Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL.min(wait_for));
                }
                Err(StoreError::Locked { name, .. }) => {
                    return Err(StoreError::Locked {
                        name,
                        message: format!(
                            "another process held the lock for longer than {wait_for:?}"
                        ),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The locked store.
    pub fn store(&self) -> &StoreName {
        &self.name
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            debug!(store = %self.name, error = %e, "store lock cleanup failed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, StoreRoot, StoreName) {
        let dir = tempfile::tempdir().unwrap();
        let root = StoreRoot::new(dir.path());
        let name = StoreName::new("locked").unwrap();
        (dir, root, name)
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let (_dir, root, name) = setup();
        let lock = StoreLock::acquire(&root, &name).unwrap();
        assert!(matches!(
            StoreLock::acquire(&root, &name),
            Err(StoreError::Locked { .. })
        ));
        drop(lock);
        let _relock = StoreLock::acquire(&root, &name).unwrap();
    }

    #[test]
    fn drop_releases_even_after_panic() {
        let (_dir, root, name) = setup();
        let result = std::panic::catch_unwind(|| {
            let _lock = StoreLock::acquire(&root, &name).unwrap();
            panic!("simulated task failure");
        });
        assert!(result.is_err());
        // The unwind dropped the guard; the lock is free again.
        let _lock = StoreLock::acquire(&root, &name).unwrap();
    }

    #[test]
    fn acquire_wait_times_out() {
        let (_dir, root, name) = setup();
        let _held = StoreLock::acquire(&root, &name).unwrap();
        let started = Instant::now();
        let result = StoreLock::acquire_wait(&root, &name, Duration::from_millis(300));
        assert!(matches!(result, Err(StoreError::Locked { .. })));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn acquire_wait_succeeds_once_released() {
        let (_dir, root, name) = setup();
        let held = StoreLock::acquire(&root, &name).unwrap();
        let root2 = root.clone();
        let name2 = name.clone();
        let waiter = std::thread::spawn(move || {
            StoreLock::acquire_wait(&root2, &name2, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(100));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
    }
}
