//! Poison-recovering lock extension traits.
//!
//! When a thread panics while holding a `Mutex` or `RwLock`, the lock becomes
//! "poisoned" — all subsequent `.lock()` / `.read()` / `.write()` calls return
//! `Err(PoisonError)`. An init process (PID 1) must **never** cascade one
//! thread's panic into every other thread, so we recover the inner data from
//! the `PoisonError` and continue.
//!
//! The global options store and the signed-keys table use these for their
//! borrow/remit discipline: a caller obtains exclusive access, mutates, and
//! returns it by dropping the guard.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Extension trait that adds a poison-recovering lock method to `Mutex`.
pub trait MutexExt<T> {
    /// Acquire the mutex, recovering from a poisoned state.
    fn lock_poisoned(&self) -> MutexGuard<'_, T>;
}

/// Extension trait that adds poison-recovering methods to `RwLock`.
pub trait RwLockExt<T> {
    /// Acquire a read lock, recovering from a poisoned state.
    fn read_poisoned(&self) -> RwLockReadGuard<'_, T>;

    /// Acquire a write lock, recovering from a poisoned state.
    fn write_poisoned(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_poisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| {
            log::warn!("Recovered poisoned Mutex (a thread panicked while holding this lock)");
            e.into_inner()
        })
    }
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_poisoned(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|e| {
            log::warn!(
                "Recovered poisoned RwLock (read) (a thread panicked while holding this lock)"
            );
            e.into_inner()
        })
    }

    fn write_poisoned(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|e| {
            log::warn!(
                "Recovered poisoned RwLock (write) (a thread panicked while holding this lock)"
            );
            e.into_inner()
        })
    }
}
