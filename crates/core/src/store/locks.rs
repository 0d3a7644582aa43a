//! Per-store exclusive locks.
//!
//! Anything that moves a store's HEAD or rewrites its working tree (branch
//! switches during a sync, fast-forwards, content commits) takes the lock of
//! that store first. Components share one [`StoreLocks`] through an `Arc`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::store::layout;

/// Held while a store is being mutated. Released on drop.
pub type StoreGuard = OwnedMutexGuard<()>;

/// Registry of per-store locks, keyed by canonical store path.
#[derive(Debug, Default)]
pub struct StoreLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl StoreLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| {
            warn!("store lock table was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Wait for exclusive access to the store at `root`.
    pub async fn acquire(&self, root: &Path) -> Result<StoreGuard, StoreError> {
        let key = layout::store_key(root)?;
        // The table guard must be gone before awaiting the store lock.
        let lock = self.table().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        debug!(store = %key.display(), "store lock acquired");
        Ok(guard)
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, root: &Path) -> Result<Option<StoreGuard>, StoreError> {
        let key = layout::store_key(root)?;
        let lock = self.table().entry(key).or_default().clone();
        Ok(lock.try_lock_owned().ok())
    }

    /// Drop the entry of a store that no longer exists.
    pub fn forget(&self, key: &Path) {
        self.table().remove(key);
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
