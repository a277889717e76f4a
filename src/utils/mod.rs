//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `popmesh` crate.
//!
//! This module centralizes reusable components: the crate error type,
//! logging initialisation and port discovery helpers.

pub mod error;
pub mod logging;
pub mod net;

use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// None of the guarded collections in this crate can be left half-updated by
/// a panic, so the data behind a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests;
