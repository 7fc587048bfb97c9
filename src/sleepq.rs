//! Sleep queues: per-resource collections of parked tasks
//!
//! A sleep queue owns one lock slot in the registry. While a task is
//! parked here, that slot IS the task's current lock: `enqueue` performs
//! the hand-off (publish the queue's handle under the task's old lock,
//! then release the old lock while still holding the queue's), and every
//! wake path hands the task back to the run-queue lock before making it
//! eligible again.
//!
//! Wakeups are FIFO within a queue. An interruptible sleeper can be
//! kicked out early (suspension request, pending signal); the kick is
//! visible to the sleeper as an interrupted park.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::condvar::relax;
use crate::error::Result;
use crate::lock::{LockHandle, LockRegistry, TaskLockGuard};
use crate::task::{Task, TaskState, Tid, NO_WCHAN};

/// Sleep entry flags
mod entry_flags {
    /// Entry has been woken
    pub const WOKEN: u32 = 1 << 0;
    /// The wake was a kick, not the awaited event
    pub const INTERRUPTED: u32 = 1 << 1;
}

/// How a park ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    /// The awaited event occurred
    Woken,
    /// Kicked out of an interruptible sleep before the event
    Interrupted,
}

/// One parked task
pub struct SleepEntry {
    tid: Tid,
    /// Whether a kick may end this sleep early
    interruptible: bool,
    flags: AtomicU32,
}

impl SleepEntry {
    fn new(tid: Tid, interruptible: bool) -> Self {
        Self {
            tid,
            interruptible,
            flags: AtomicU32::new(0),
        }
    }

    /// Task this entry parks
    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    fn wake(&self, interrupted: bool) {
        let mut bits = entry_flags::WOKEN;
        if interrupted {
            bits |= entry_flags::INTERRUPTED;
        }
        self.flags.fetch_or(bits, Ordering::Release);
    }

    fn is_woken(&self) -> bool {
        self.flags.load(Ordering::Acquire) & entry_flags::WOKEN != 0
    }

    /// Spin until woken; models the context switch away from the task
    ///
    /// Called by the parked task itself after `enqueue` returns.
    pub fn block(&self) -> ParkOutcome {
        while !self.is_woken() {
            relax();
        }
        if self.flags.load(Ordering::Acquire) & entry_flags::INTERRUPTED != 0 {
            ParkOutcome::Interrupted
        } else {
            ParkOutcome::Woken
        }
    }
}

/// A per-resource wait queue plus the lock that protects it
pub struct SleepQueue {
    handle: LockHandle,
    /// Channel token stamped into parked tasks
    wchan: u64,
    /// Parked entries, FIFO; manipulated only under the queue's lock slot
    entries: Mutex<VecDeque<Arc<SleepEntry>>>,
}

impl SleepQueue {
    /// Create a queue, claiming a lock slot from the registry
    ///
    /// `wchan` identifies the awaited resource; it must be nonzero.
    pub fn new(registry: &LockRegistry, wchan: u64) -> Result<Self> {
        assert_ne!(wchan, NO_WCHAN, "sleep channel token must be nonzero");
        Ok(Self {
            handle: registry.claim_sleepq_handle()?,
            wchan,
            entries: Mutex::new(VecDeque::new()),
        })
    }

    /// Handle of this queue's lock
    #[inline]
    pub fn handle(&self) -> LockHandle {
        self.handle
    }

    /// Channel token
    #[inline]
    pub fn wchan(&self) -> u64 {
        self.wchan
    }

    /// Number of parked tasks
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if no task is parked here
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Park a task on this queue
    ///
    /// The caller holds the task's current lock and has already made the
    /// task ineligible to run. The task's lock is handed to this queue:
    /// after return, whoever holds the queue's lock holds the task.
    /// The caller (the task itself) then calls [`SleepEntry::block`].
    pub fn enqueue(
        &self,
        registry: &LockRegistry,
        task: &Task,
        guard: TaskLockGuard<'_>,
        interruptible: bool,
    ) -> Arc<SleepEntry> {
        // Lock order: the caller's lock (processor) precedes ours
        let slot = registry.lock_slot(self.handle);

        task.set_state(&guard, TaskState::Sleeping);
        task.set_wchan(&guard, self.wchan);

        let entry = Arc::new(SleepEntry::new(task.id(), interruptible));
        self.entries.lock().push_back(entry.clone());

        // Publish our lock as the task's, then release the old one. The
        // task stays protected throughout: we still hold `slot`.
        registry.assign_new_lock(task, guard, self.handle);
        drop(slot);
        entry
    }

    /// Wake a specific parked task
    ///
    /// Returns the entry if the task was parked here. On return the task
    /// is Runnable and guarded by the run-queue lock again; the caller
    /// re-enqueues it with the scheduler and fixes counters.
    pub fn unsleep(
        &self,
        registry: &LockRegistry,
        task: &Task,
        interrupt: bool,
    ) -> Option<Arc<SleepEntry>> {
        // Acquiring the task's lock yields this queue's lock while the
        // task is parked here; re-verify it actually is.
        let guard = registry.lock_task(task);
        if guard.handle() != self.handle || task.wchan() != self.wchan {
            return None;
        }
        if interrupt {
            let entry = {
                let entries = self.entries.lock();
                entries.iter().find(|e| e.tid() == task.id()).cloned()
            };
            // A kick only takes effect on interruptible sleeps
            match entry {
                Some(e) if e.interruptible => {}
                _ => return None,
            }
        }

        let entry = {
            let mut entries = self.entries.lock();
            let pos = entries.iter().position(|e| e.tid() == task.id())?;
            entries.remove(pos)?
        };

        self.finish_wake(registry, task, guard, &entry, interrupt);
        Some(entry)
    }

    /// Wake the longest-parked task, if any
    pub fn wake_one(&self, registry: &LockRegistry, lookup: impl Fn(Tid) -> Option<Arc<Task>>) -> Option<Arc<SleepEntry>> {
        loop {
            let entry = {
                let mut entries = self.entries.lock();
                entries.pop_front()?
            };
            let Some(task) = lookup(entry.tid()) else {
                // Task vanished while parked; should not happen, but a
                // stale entry must not wedge the queue
                continue;
            };
            let guard = registry.lock_task(&task);
            if guard.handle() != self.handle {
                continue;
            }
            self.finish_wake(registry, &task, guard, &entry, false);
            return Some(entry);
        }
    }

    /// Wake every parked task, returning the woken entries in FIFO order
    pub fn wake_all(
        &self,
        registry: &LockRegistry,
        lookup: impl Fn(Tid) -> Option<Arc<Task>>,
    ) -> alloc::vec::Vec<Arc<SleepEntry>> {
        let mut woken = alloc::vec::Vec::new();
        while let Some(entry) = self.wake_one(registry, &lookup) {
            woken.push(entry);
        }
        woken
    }

    /// Transition a parked task back to Runnable and hand its lock to
    /// the run queue; wakes the parked thread last
    fn finish_wake(
        &self,
        registry: &LockRegistry,
        task: &Task,
        guard: TaskLockGuard<'_>,
        entry: &SleepEntry,
        interrupted: bool,
    ) {
        task.set_wchan(&guard, NO_WCHAN);
        task.set_state(&guard, TaskState::Runnable);
        registry.assign_new_lock(task, guard, registry.run_queue_handle());
        entry.wake(interrupted);
    }
}
