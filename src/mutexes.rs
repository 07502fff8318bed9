//! Keyed mutex registry.
//!
//! Hands out one lock per key, created lazily on first request and shared by
//! every caller that asks for the same key. Callers use it to serialize access
//! to a logical resource (a file, a remote path, an account) without a global
//! lock.
//!
//! Keys are never evicted. A long-lived registry holds one lock per distinct
//! key it has ever seen; that growth is accepted in exchange for never having
//! to coordinate removal with concurrent acquirers.

use dashmap::DashMap;
use parking_lot::lock_api::ArcReentrantMutexGuard;
use parking_lot::{RawMutex, RawThreadId, ReentrantMutex};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::trace;

use crate::telemetry::metrics;

type Lock = Arc<ReentrantMutex<()>>;
type Guard = ArcReentrantMutexGuard<RawMutex, RawThreadId, ()>;

/// Registry of lazily-created, reentrant per-key locks.
///
/// Fairness is a registry-wide setting: a fair registry hands a released lock
/// directly to the longest waiter; an unfair one lets the releasing thread (or
/// any other) barge in.
pub struct KeyedMutexes<K> {
    locks: DashMap<K, Lock>,
    fair: bool,
}

impl<K> KeyedMutexes<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an unfair registry.
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    /// Create a registry whose locks wake waiters in FIFO order.
    pub fn fair() -> Self {
        Self::with_fairness(true)
    }

    pub fn with_fairness(fair: bool) -> Self {
        Self {
            locks: DashMap::new(),
            fair,
        }
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Block until the lock for `key` is free and return a handle holding it.
    ///
    /// The lock is released when the handle is released or dropped, so a
    /// critical section that returns early or panics still unlocks. The
    /// holding thread may acquire the same key again without deadlocking.
    pub fn acquire(&self, key: K) -> MutexHandle {
        let lock = self.lock_for(key);
        let guard = lock.lock_arc();
        metrics::mutex_acquired().add(1, &[]);
        MutexHandle {
            guard: Some(guard),
            fair: self.fair,
        }
    }

    /// Acquire the lock for `key` only if it is free right now.
    pub fn try_acquire(&self, key: K) -> Option<MutexHandle> {
        let lock = self.lock_for(key);
        let guard = lock.try_lock_arc()?;
        metrics::mutex_acquired().add(1, &[]);
        Some(MutexHandle {
            guard: Some(guard),
            fair: self.fair,
        })
    }

    /// Number of distinct keys that have ever been requested.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Look up the lock for `key`, inserting a new one if absent.
    ///
    /// The shard guard is dropped before the caller blocks on the lock.
    fn lock_for(&self, key: K) -> Lock {
        if let Some(existing) = self.locks.get(&key) {
            return Arc::clone(existing.value());
        }
        let entry = self.locks.entry(key).or_insert_with(|| {
            trace!("creating keyed mutex");
            Arc::new(ReentrantMutex::new(()))
        });
        Arc::clone(entry.value())
    }
}

impl<K> Default for KeyedMutexes<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> fmt::Debug for KeyedMutexes<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedMutexes")
            .field("keys", &self.locks.len())
            .field("fair", &self.fair)
            .finish()
    }
}

/// A held keyed lock. Released by [`MutexHandle::release`] or on drop.
///
/// The handle must be released on the thread that acquired it.
#[must_use = "dropping the handle releases the lock immediately"]
pub struct MutexHandle {
    guard: Option<Guard>,
    fair: bool,
}

impl MutexHandle {
    /// Release the lock.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(guard) = self.guard.take() {
            if self.fair {
                Guard::unlock_fair(guard);
            } else {
                drop(guard);
            }
        }
    }
}

impl Drop for MutexHandle {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl fmt::Debug for MutexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexHandle")
            .field("held", &self.guard.is_some())
            .field("fair", &self.fair)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_accumulate_and_are_never_evicted() {
        let mutexes = KeyedMutexes::new();
        assert!(mutexes.is_empty());

        mutexes.acquire("a").release();
        mutexes.acquire("b").release();
        mutexes.acquire("a").release();

        assert_eq!(mutexes.len(), 2);
    }

    #[test]
    fn debug_reports_key_count_and_fairness() {
        let mutexes = KeyedMutexes::fair();
        mutexes.acquire(1u32).release();
        let rendered = format!("{mutexes:?}");
        assert!(rendered.contains("keys: 1"));
        assert!(rendered.contains("fair: true"));
    }

    #[test]
    fn try_acquire_fails_while_held_elsewhere() {
        let mutexes = Arc::new(KeyedMutexes::<String>::new());
        let held = mutexes.acquire("res".to_string());

        let other = Arc::clone(&mutexes);
        let acquired = std::thread::spawn(move || other.try_acquire("res".to_string()).is_some())
            .join()
            .unwrap();
        assert!(!acquired);

        held.release();
        let other = Arc::clone(&mutexes);
        let acquired = std::thread::spawn(move || other.try_acquire("res".to_string()).is_some())
            .join()
            .unwrap();
        assert!(acquired);
    }
}
