// src/core/mod.rs

pub mod command;
pub mod session;
pub mod toolbox;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a worker panicked while holding it.
/// Queue and command state stay consistent because every critical section is
/// a handful of field writes with no early exit.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
