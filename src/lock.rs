//! Dynamic lock ownership for tasks
//!
//! Rather than one global lock, each task carries a handle to whichever
//! lock currently protects its mutable fields. The lock in force follows
//! the task's scheduling domain: Idle/Runnable tasks are guarded by the
//! run-queue lock, OnProcessor/Zombie tasks by a per-processor lock, and
//! Sleeping tasks by the lock of the sleep queue they are parked on.
//! Stopped/Suspended tasks keep whichever lock they last had.
//!
//! Because the handle can change between reading it and acquiring the
//! denoted lock, acquisition MUST re-check the handle after the acquire
//! and retry if it moved. `lock_task` and `try_lock_task` implement that
//! loop; there is no way to obtain a [`TaskLockGuard`] that skips it.
//!
//! Handles index a closed, fixed-capacity table of spin mutexes rather
//! than raw pointers, so a stale handle can never dangle.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use spin::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::task::{Task, Tid};

/// Maximum number of processors, and thus per-processor lock slots
pub const MAX_CPUS: usize = 64;

/// Index of a lock in the registry's slot table
///
/// Slot 0 is the run-queue lock, slots 1..=MAX_CPUS the per-processor
/// locks; the remaining slots are claimed by sleep queues at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHandle(u16);

impl LockHandle {
    #[inline]
    pub(crate) fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(raw: u16) -> Self {
        Self(raw)
    }
}

/// The closed set of locks a task handle may denote
pub struct LockRegistry {
    slots: Vec<Mutex<()>>,
    /// Next unclaimed sleep-queue slot
    next_free: AtomicU16,
}

impl LockRegistry {
    /// Build a registry with `sleepq_slots` slots available to sleep
    /// queues, beyond the run-queue and per-processor slots
    pub fn new(sleepq_slots: usize) -> Self {
        let total = 1 + MAX_CPUS + sleepq_slots;
        assert!(total <= u16::MAX as usize, "lock table too large");
        let mut slots = Vec::with_capacity(total);
        for _ in 0..total {
            slots.push(Mutex::new(()));
        }
        Self {
            slots,
            next_free: AtomicU16::new((1 + MAX_CPUS) as u16),
        }
    }

    /// Handle of the scheduler run-queue lock
    #[inline]
    pub fn run_queue_handle(&self) -> LockHandle {
        LockHandle(0)
    }

    /// Handle of the lock for processor `cpu`
    #[inline]
    pub fn processor_handle(&self, cpu: u32) -> LockHandle {
        assert!((cpu as usize) < MAX_CPUS, "cpu id out of range");
        LockHandle(1 + cpu as u16)
    }

    /// Claim a lock slot for a new sleep queue
    ///
    /// Sleep-queue locks live for the lifetime of the registry; slots are
    /// not returned.
    pub fn claim_sleepq_handle(&self) -> Result<LockHandle> {
        let idx = self.next_free.fetch_add(1, Ordering::AcqRel);
        if (idx as usize) >= self.slots.len() {
            // Undo so repeated failures cannot wrap the counter
            self.next_free.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::OutOfMemory);
        }
        Ok(LockHandle(idx))
    }

    /// Acquire a specific slot directly (not through a task's handle)
    ///
    /// Used when a subsystem owns the lock in question, e.g. a sleep
    /// queue taking its own lock before tasks are handed to it.
    pub fn lock_slot(&self, h: LockHandle) -> SlotGuard<'_> {
        SlotGuard {
            handle: h,
            guard: self.slots[h.0 as usize].lock(),
        }
    }

    /// Acquire whichever lock currently protects `task`
    ///
    /// Optimistic loop: read the handle, acquire the denoted lock, then
    /// re-read. If a concurrent transition moved the task to a different
    /// lock in between, drop and retry. On return the held lock is the
    /// task's current lock.
    pub fn lock_task<'a>(&'a self, task: &Task) -> TaskLockGuard<'a> {
        loop {
            let h = task.lock_handle();
            let guard = self.slots[h.0 as usize].lock();
            if task.lock_handle() == h {
                return TaskLockGuard {
                    handle: h,
                    tid: task.id(),
                    guard: Some(guard),
                };
            }
            // Raced with a lock hand-off; retry against the new handle
            drop(guard);
        }
    }

    /// Non-blocking variant of `lock_task`
    ///
    /// Fails (rather than retrying) both when the lock is contended and
    /// when the verify-after-acquire check sees the handle change.
    pub fn try_lock_task<'a>(&'a self, task: &Task) -> Option<TaskLockGuard<'a>> {
        let h = task.lock_handle();
        let guard = self.slots[h.0 as usize].try_lock()?;
        if task.lock_handle() != h {
            return None;
        }
        Some(TaskLockGuard {
            handle: h,
            tid: task.id(),
            guard: Some(guard),
        })
    }

    /// Hand the task to a different lock
    ///
    /// The caller holds the task's current lock via `guard`. The new
    /// handle is published while the old lock is still held (so there is
    /// no window in which the task is unprotected), then the old lock is
    /// released. The caller is expected to already hold the new lock when
    /// continued protection is needed, e.g. when enqueueing onto a sleep
    /// queue whose lock was taken beforehand.
    pub fn assign_new_lock(&self, task: &Task, guard: TaskLockGuard<'_>, new: LockHandle) {
        assert_eq!(
            guard.handle,
            task.lock_handle(),
            "assign_new_lock without holding the current lock"
        );
        task.store_lock_handle(new);
        drop(guard);
    }

    /// Re-derive a witness guard for a task from a directly held slot
    ///
    /// The caller holds `slot` and the task's current lock is that slot
    /// (e.g. a sleep queue waking a task parked on it). Consumes the slot
    /// guard; dropping the returned guard releases the lock.
    pub fn guard_for<'a>(&self, task: &Task, slot: SlotGuard<'a>) -> TaskLockGuard<'a> {
        assert_eq!(
            slot.handle,
            task.lock_handle(),
            "slot is not the task's current lock"
        );
        TaskLockGuard {
            handle: slot.handle,
            tid: task.id(),
            guard: Some(slot.guard),
        }
    }

    /// Drop and re-acquire the task's current lock
    ///
    /// The task may have been handed to a different lock in between; the
    /// returned guard reflects the new one.
    pub fn relock<'a>(&'a self, task: &Task, guard: TaskLockGuard<'a>) -> TaskLockGuard<'a> {
        drop(guard);
        self.lock_task(task)
    }
}

/// A directly held registry slot
pub struct SlotGuard<'a> {
    handle: LockHandle,
    guard: MutexGuard<'a, ()>,
}

impl SlotGuard<'_> {
    /// Handle of the held slot
    #[inline]
    pub fn handle(&self) -> LockHandle {
        self.handle
    }
}

/// Witness that the holder owns a task's current lock
///
/// Mutators on `Task` take this by reference, making the locking
/// discipline visible in their signatures.
pub struct TaskLockGuard<'a> {
    handle: LockHandle,
    tid: Tid,
    guard: Option<MutexGuard<'a, ()>>,
}

impl TaskLockGuard<'_> {
    /// Handle of the lock this guard holds
    #[inline]
    pub fn handle(&self) -> LockHandle {
        self.handle
    }

    /// Task this guard was taken for
    #[inline]
    pub(crate) fn tid(&self) -> Tid {
        self.tid
    }
}

impl Drop for TaskLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
    }
}
