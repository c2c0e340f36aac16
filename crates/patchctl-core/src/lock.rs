//! Keyed async locks.
//!
//! Git operations against one repository must be serialized, and the issue
//! guard's search-then-decide sequence must be exclusive per category. Both
//! use a [`KeyedLocks`] registry: one `tokio::sync::Mutex` per key, created on
//! first use and shared by every caller in the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::OwnedMutexGuard;

/// Registry of per-key mutexes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Wait for exclusive access to `key`. The lock is held until the guard
    /// is dropped.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    /// Try to take `key` without waiting.
    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.handle(key).try_lock_owned().ok()
    }
}

/// Process-wide lock registry keyed by canonical repository root.
pub fn repo_locks() -> &'static KeyedLocks {
    static REPO_LOCKS: OnceLock<KeyedLocks> = OnceLock::new();
    REPO_LOCKS.get_or_init(KeyedLocks::new)
}

/// Process-wide lock registry keyed by issue category. Shared by every
/// duplication guard, so two guards over one tracker cannot both create.
pub fn issue_locks() -> &'static KeyedLocks {
    static ISSUE_LOCKS: OnceLock<KeyedLocks> = OnceLock::new();
    ISSUE_LOCKS.get_or_init(KeyedLocks::new)
}

/// Lock key for a repository root. Canonicalizes when possible so that two
/// spellings of the same directory share one lock.
pub fn repo_key(root: &Path) -> String {
    let canonical: PathBuf = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    canonical.to_string_lossy().into_owned()
}
