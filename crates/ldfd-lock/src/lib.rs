//! Single-flight coalescing for concurrent fetches of the same key.
//!
//! Across concurrent jobs on the same `(source_id, version)`, the
//! artifact cache serializes fetches: the first job fetches; subsequent
//! jobs either wait on a per-key single-flight primitive or observe the
//! committed cache entry. This crate provides that primitive as an
//! in-process keyed lock table, the same RAII-guard idiom the rest of
//! the workspace uses for filesystem locks: acquiring
//! blocks until free, and the guard's `Drop` releases.
//!
//! Built on a condvar rather than `std::sync::Mutex` directly, because a
//! `MutexGuard` cannot be handed back across an owning struct boundary —
//! the flag-plus-condvar shape is the standard way to build an ownable
//! lock guard in safe Rust.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

struct Slot {
    held: Mutex<bool>,
    free: Condvar,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(false),
            free: Condvar::new(),
        })
    }

    fn acquire(self: Arc<Self>) -> KeyedLockGuard {
        let mut held = self.held.lock().expect("single-flight slot poisoned");
        while *held {
            held = self.free.wait(held).expect("single-flight slot poisoned");
        }
        *held = true;
        drop(held);
        KeyedLockGuard { slot: self }
    }
}

/// A table of per-key slots. Two callers racing on the same key
/// serialize on that key's slot; callers on different keys never block
/// each other.
pub struct KeyedLock<K> {
    slots: Mutex<HashMap<K, Arc<Slot>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key`'s slot is free, then hold it until the returned
    /// guard drops. Concurrent callers for a *different* key never wait on
    /// this one.
    pub fn lock(&self, key: K) -> KeyedLockGuard {
        let slot = {
            let mut slots = self.slots.lock().expect("keyed lock table poisoned");
            slots.entry(key).or_insert_with(Slot::new).clone()
        };
        slot.acquire()
    }

    /// Drop a key's table entry once nothing references it, so the table
    /// doesn't grow without bound across a long-running server's
    /// lifetime. Safe to call even while the slot is held elsewhere: the
    /// `Arc` keeps that slot alive for whoever is still holding it, and a
    /// future `lock()` for the same key simply allocates a fresh slot.
    pub fn evict(&self, key: &K) {
        self.slots.lock().expect("keyed lock table poisoned").remove(key);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("keyed lock table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct KeyedLockGuard {
    slot: Arc<Slot>,
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        let mut held = self.slot.held.lock().expect("single-flight slot poisoned");
        *held = false;
        drop(held);
        self.slot.free.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn different_keys_do_not_block_each_other() {
        let lock: KeyedLock<&str> = KeyedLock::new();
        let _a = lock.lock("a");
        let start = std::time::Instant::now();
        let _b = lock.lock("b");
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn evict_does_not_panic_on_missing_key() {
        let lock: KeyedLock<&str> = KeyedLock::new();
        lock.evict(&"never-locked");
        assert!(lock.is_empty());
    }

    #[test]
    fn lock_is_reusable_after_guard_drops() {
        let lock: KeyedLock<&str> = KeyedLock::new();
        {
            let _g = lock.lock("k");
        }
        let start = std::time::Instant::now();
        let _g2 = lock.lock("k");
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn concurrent_same_key_serializes() {
        let lock: Arc<KeyedLock<&str>> = Arc::new(KeyedLock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                let _guard = lock.lock("same");
                let before = counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
