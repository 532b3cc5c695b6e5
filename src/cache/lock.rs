//! Per-key mutual exclusion for cache population

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One mutex per cache key, created on first use and dropped once no caller
/// holds it.
///
/// Only serializes callers sharing this value; other processes are not
/// excluded.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the mutex of `key`
    pub fn with<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.get(key);
        let result = {
            let _guard = acquire(&lock);
            f()
        };
        self.release(key, lock);
        result
    }

    fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.map();
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop our handle and the map entry if nobody else still holds one.
    /// Clones are only made under the map lock, so the count is stable here.
    fn release(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.map();
        let unused = locks
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(&lock) == 2);
        if unused {
            locks.remove(key);
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map().len()
    }
}

/// Lock a key mutex, ignoring poisoning from a panicked holder
fn acquire(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
