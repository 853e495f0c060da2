//! Advisory merge locks
//!
//! Serializes merges touching the same object pair. The key is an
//! order-independent canonicalization of the two ids (sorted pair), so
//! `merge(a, b)` and `merge(b, a)` contend on the same lock. Locks are
//! in-process async mutexes held for the duration of the merge
//! transaction and released when the guard drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};

/// Default time to wait for a contended merge lock
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Registry of per-pair merge locks
#[derive(Debug)]
pub struct MergeLockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    wait: Duration,
}

impl MergeLockRegistry {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_LOCK_WAIT)
    }

    /// Acquire the lock for an id pair, waiting up to the configured
    /// timeout. Returns `LockTimeout` on contention past the deadline.
    pub async fn acquire(&self, id_a: &str, id_b: &str) -> Result<MergeLockGuard> {
        let key = pair_key(id_a, id_b);

        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };

        debug!(lock_key = %key, "Acquiring merge lock");
        let guard = timeout(self.wait, lock.lock_owned())
            .await
            .map_err(|_| Error::LockTimeout(key.clone()))?;
        debug!(lock_key = %key, "Merge lock acquired");

        Ok(MergeLockGuard {
            key,
            _guard: guard,
        })
    }
}

impl Default for MergeLockRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Holds the merge lock; dropping releases it
#[derive(Debug)]
pub struct MergeLockGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl MergeLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for MergeLockGuard {
    fn drop(&mut self) {
        debug!(lock_key = %self.key, "Merge lock released");
    }
}

/// Order-independent key for an id pair
pub(crate) fn pair_key(id_a: &str, id_b: &str) -> String {
    if id_a <= id_b {
        format!("{id_a}:{id_b}")
    } else {
        format!("{id_b}:{id_a}")
    }
}
