//! In-process advisory locks
//!
//! Cooperative, non-blocking mutual exclusion keyed by (scope, id). Tasks
//! that find a lock held must skip or reschedule themselves; nothing ever
//! blocks waiting for one. Guards release their key on drop.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// Shared registry of held advisory locks
#[derive(Clone, Default)]
pub struct AdvisoryLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

/// A held advisory lock; released on drop
pub struct LockGuard {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for (scope, id). Returns None when already held.
    pub fn try_acquire(&self, scope: &str, id: &str) -> Option<LockGuard> {
        let key = format!("{scope}:{id}");
        let mut held = self.held.lock();
        if held.insert(key.clone()) {
            Some(LockGuard {
                key,
                held: self.held.clone(),
            })
        } else {
            None
        }
    }

    /// Lock an entity by uuid under a scope
    pub fn try_acquire_entity(&self, scope: &str, id: Uuid) -> Option<LockGuard> {
        self.try_acquire(scope, &id.to_string())
    }

    /// Try to take a process-global named lock
    pub fn try_acquire_global(&self, name: &str) -> Option<LockGuard> {
        self.try_acquire("global", name)
    }

    pub fn is_held(&self, scope: &str, id: &str) -> bool {
        let key = format!("{scope}:{id}");
        self.held.lock().contains(&key)
    }

    pub fn is_held_entity(&self, scope: &str, id: Uuid) -> bool {
        self.is_held(scope, &id.to_string())
    }

    /// Forcibly clear every lock held under a scope for the given ids.
    ///
    /// Used before re-indexing a source to drop stale per-media locks left
    /// behind by crashed or revoked tasks.
    pub fn clear_entities(&self, scope: &str, ids: &[Uuid]) {
        let mut held = self.held.lock();
        for id in ids {
            held.remove(&format!("{scope}:{id}"));
        }
    }
}
