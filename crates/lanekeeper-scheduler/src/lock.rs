//! Cross-process advisory locking.
//!
//! Only one dispatcher across a fleet may run the scheduling loop; the lock
//! is acquired once at loop startup and held until shutdown.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Held for as long as the lock is owned; dropping releases it.
pub trait LockGuard: Send {}

/// A named, cross-process mutual exclusion primitive.
pub trait SchedulerLock: Send + Sync {
    /// Try to take the named lock. `None` when another holder has it.
    fn try_acquire(&self, name: &str) -> Option<Box<dyn LockGuard>>;
}

/// Lock files in a shared directory. Adequate for a single machine; a
/// fleet-grade lock service can be slotted in behind [`SchedulerLock`].
pub struct FileLock {
    dir: PathBuf,
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

struct FileLockGuard {
    path: PathBuf,
}

impl LockGuard for FileLockGuard {}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove lock file");
        }
    }
}

impl SchedulerLock for FileLock {
    fn try_acquire(&self, name: &str) -> Option<Box<dyn LockGuard>> {
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %err, "cannot create lock directory");
            return None;
        }

        let path = self.dir.join(format!("{}.lock", name));
        // TODO: detect stale lock files left by a crashed scheduler (probe
        // the recorded pid) instead of requiring manual removal.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .ok()?;
        let _ = writeln!(file, "{}", std::process::id());

        Some(Box::new(FileLockGuard { path }))
    }
}

/// In-process lock for tests and single-binary deployments.
#[derive(Default, Clone)]
pub struct LocalLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalLockGuard {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockGuard for LocalLockGuard {}

impl Drop for LocalLockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

impl SchedulerLock for LocalLock {
    fn try_acquire(&self, name: &str) -> Option<Box<dyn LockGuard>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(name.to_string()) {
            return None;
        }
        Some(Box::new(LocalLockGuard {
            name: name.to_string(),
            held: self.held.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_lock_is_exclusive_until_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = FileLock::new(tmp.path());

        let guard = lock.try_acquire("scheduler").unwrap();
        assert!(lock.try_acquire("scheduler").is_none());
        // A different name is independent.
        assert!(lock.try_acquire("other").is_some());

        drop(guard);
        assert!(lock.try_acquire("scheduler").is_some());
    }

    #[test]
    fn local_lock_is_exclusive_per_name() {
        let lock = LocalLock::new();
        let guard = lock.try_acquire("scheduler").unwrap();
        assert!(lock.try_acquire("scheduler").is_none());
        drop(guard);
        assert!(lock.try_acquire("scheduler").is_some());
    }
}
