//! Run locks.
//!
//! [`KeyedLocks`] serializes holders of one key inside a process. [`FileLock`]
//! is an exclusive advisory lock on a file, which also excludes other
//! processes sharing a state directory. Each open handle is its own lock
//! owner, so two `FileLock`s on one path conflict even within one process.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use anyhow::Context;
use tracing::{debug, warn};

#[derive(Default)]
pub struct KeyedLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it until the guard drops.
    pub fn lock(&self, key: &str) -> KeyedLockGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while held.contains(key) {
            debug!(key, "waiting for keyed lock");
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        held.insert(key.to_string());
        KeyedLockGuard {
            locks: self,
            key: key.to_string(),
        }
    }

    #[cfg(test)]
    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }
}

pub struct KeyedLockGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
}

impl Drop for KeyedLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
        self.locks.released.notify_all();
    }
}

/// Exclusive lock on a lock file, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock on `path` is ours. Creates the file and its parents.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lock {}", path.display()))?;
        if fs2::FileExt::try_lock_exclusive(&file).is_err() {
            debug!(path = %path.display(), "waiting for file lock");
            fs2::FileExt::lock_exclusive(&file)
                .with_context(|| format!("lock {}", path.display()))?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release file lock");
        }
    }
}

/// Single-writer hold on one run, from [`crate::io::run_store::RunStore::lock_run`].
pub enum RunLock<'a> {
    Local { _guard: KeyedLockGuard<'a> },
    File { _lock: FileLock },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let _guard = locks.lock("run-1");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!locks.is_held("run-1"));
    }

    #[test]
    fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("run-a");
        let _b = locks.lock("run-b");
        assert!(locks.is_held("run-a"));
        assert!(locks.is_held("run-b"));
    }

    #[test]
    fn file_lock_excludes_a_second_handle_until_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runs").join("run-1").join(".run.lock");
        let first = FileLock::acquire(&path).expect("first lock");

        let other = File::open(&path).expect("open");
        assert!(fs2::FileExt::try_lock_exclusive(&other).is_err());

        drop(first);
        fs2::FileExt::try_lock_exclusive(&other).expect("free after drop");
        fs2::FileExt::unlock(&other).expect("unlock");
    }

    #[test]
    fn file_lock_serializes_threads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".store.lock");
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let _lock = FileLock::acquire(&path).expect("lock");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
