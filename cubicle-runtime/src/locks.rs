//! Per-key mutual exclusion.
//!
//! One async mutex per key, created on first use and dropped again when the
//! last holder or waiter lets go. Operations on the same key run one after
//! another; operations on different keys never contend beyond the short
//! critical section guarding the map itself.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots<K> = HashMap<K, Arc<AsyncMutex<()>>>;

/// Arena of lazily created per-key locks.
#[derive(Debug)]
pub struct LockArena<K> {
    locks: Mutex<Slots<K>>,
}

impl<K: Eq + Hash + Clone> LockArena<K> {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn acquire(&self, key: K) -> LockGuard<'_, K> {
        let lock = {
            let mut slots = self.slots();
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        LockGuard {
            arena: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Returns `true` if no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots(&self) -> MutexGuard<'_, Slots<K>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the slot for `key` if the map holds the only reference.
    ///
    /// Waiters clone the `Arc` under the map lock before awaiting, so a count
    /// of one means nobody is holding or queued on this key.
    fn release(&self, key: &K) {
        let mut slots = self.slots();
        if slots.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            slots.remove(key);
        }
    }
}

impl<K: Eq + Hash + Clone> Default for LockArena<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one key of a [`LockArena`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, K: Eq + Hash + Clone> {
    arena: &'a LockArena<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for LockGuard<'_, K> {
    fn drop(&mut self) {
        // The owned guard holds its own reference; let it go before counting.
        drop(self.guard.take());
        self.arena.release(&self.key);
    }
}
