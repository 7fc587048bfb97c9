//! Broadcast condition variable over a spin mutex
//!
//! The blocking operations of the lifecycle core (wait-for-zombie,
//! refcount drain, cooperative suspension) are all predicate loops: take
//! the owner mutex, check, sleep until something changes, re-check. This
//! condvar carries the "something changed" edge with a generation counter
//! so a broadcast between unlock and sleep can never be lost: the waiter
//! samples the generation while still holding the mutex.
//!
//! There is no wake-one: lifecycle wakeups are rare and broadcast, and
//! every waiter re-checks its predicate anyway.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

/// Yield while spinning on a predicate
///
/// Hosted builds give the OS thread up; freestanding builds hint the
/// pipeline.
#[inline]
pub(crate) fn relax() {
    #[cfg(test)]
    std::thread::yield_now();
    #[cfg(not(test))]
    core::hint::spin_loop();
}

/// A broadcast-only condition variable
pub struct CondVar {
    generation: AtomicU64,
}

impl CondVar {
    /// Create a condvar with no pending wakeups
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Wake every current waiter
    ///
    /// May be called with or without the associated mutex held.
    pub fn broadcast(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Atomically release `guard` and sleep until the next broadcast,
    /// then re-acquire the mutex
    ///
    /// Spurious wakeups are possible; callers loop on their predicate.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        let seen = self.generation.load(Ordering::Acquire);
        drop(guard);
        while self.generation.load(Ordering::Acquire) == seen {
            relax();
        }
        mutex.lock()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
