//! Task control block (TCB) and state machine
//!
//! A `Task` is one schedulable unit of execution inside an `Owner`. Its
//! mutable scheduling fields are atomics so concurrent observers are
//! data-race free, but the locking discipline is still mandatory: every
//! mutator takes a [`TaskLockGuard`] witness, so a caller cannot change
//! guarded state without holding whichever lock currently protects the
//! task (see the `lock` module).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicU8, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::ctlblock::CtlSlot;
use crate::hooks::Cred;
use crate::lock::{LockHandle, TaskLockGuard};

/// Task ID type
pub type Tid = u64;

/// Owner (process) ID type
pub type Oid = u64;

/// Task priority type (0 = lowest, 255 = highest)
pub type Priority = u8;

/// Idle priority - only runs when nothing else is ready
pub const PRIORITY_IDLE: Priority = 0;
/// Normal priority for regular tasks
pub const PRIORITY_NORMAL: Priority = 128;
/// High priority for important tasks
pub const PRIORITY_HIGH: Priority = 192;

/// Magic value stamped into every live TCB
///
/// `free` checks and clears it; freeing the same record twice or freeing
/// a corrupted record is a programmer error and panics.
pub const TASK_MAGIC: u32 = 0x4c57_5043;

/// Task state
///
/// Stopped and Suspended are side-states entered only at a safe point:
/// the user-return boundary or an interruptible-sleep wakeup. Zombie is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Created, not yet started
    Idle = 0,
    /// Eligible to run, not executing
    Runnable = 1,
    /// Currently executing on a processor
    OnProcessor = 2,
    /// Parked on a sleep queue
    Sleeping = 3,
    /// Stopped by job control, restartable via `start`
    Stopped = 4,
    /// Suspended, restartable via `resume`
    Suspended = 5,
    /// Exited, awaiting reap
    Zombie = 6,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Runnable,
            2 => Self::OnProcessor,
            3 => Self::Sleeping,
            4 => Self::Stopped,
            5 => Self::Suspended,
            6 => Self::Zombie,
            _ => unreachable!("corrupt task state"),
        }
    }

    /// Check if the task has been started and has not exited
    #[inline]
    #[must_use]
    pub const fn is_alive(self) -> bool {
        !matches!(self, Self::Idle | Self::Zombie)
    }

    /// Check if the task is in a cooperative stop state
    #[inline]
    #[must_use]
    pub const fn is_stopped_or_suspended(self) -> bool {
        matches!(self, Self::Stopped | Self::Suspended)
    }

    /// Check if the task is runnable or running
    #[inline]
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Runnable | Self::OnProcessor)
    }
}

bitflags! {
    /// Independent per-task flag bits
    ///
    /// Want-bits (`WSUSPEND`, `WEXIT`, `WCORE`) are set under the task's
    /// current lock and honored at the next safe point; they never force
    /// a state change on their own.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Running on a processor right now
        const RUNNING  = 1 << 0;
        /// Suspension requested, pending safe-point check
        const WSUSPEND = 1 << 1;
        /// Exit requested, pending safe-point check
        const WEXIT    = 1 << 2;
        /// Core dump requested, pending safe-point check
        const WCORE    = 1 << 3;
        /// A signal is pending delivery
        const PENDSIG  = 1 << 4;
        /// System (kernel-internal) task
        const SYSTEM   = 1 << 5;
        /// Reaped lazily, never requires an explicit wait
        const DETACHED = 1 << 6;
        /// One-shot user-return hook pending
        const WUSERRET = 1 << 7;
    }
}

/// A value stored in the task's specific-data table, with an optional
/// destructor run when the table is destroyed
#[derive(Clone, Copy)]
pub struct SpecificSlot {
    /// Opaque value owned by the registering subsystem
    pub value: u64,
    /// Destructor invoked exactly once, at exit time
    pub dtor: Option<fn(u64)>,
}

/// Sentinel meaning "no wait channel" / "no waiter"
pub const NO_WCHAN: u64 = 0;

/// Task control block
///
/// Storage is owned by the task's `Owner`; the `owner` field is a
/// non-owning id resolved through the owner table on each use. `refcount`
/// keeps the record inspectable after it reaches Zombie; it is drained to
/// zero during exit before the record is finalized.
pub struct Task {
    magic: AtomicU32,
    id: Tid,
    owner: Oid,
    state: AtomicU8,
    flags: AtomicU32,
    lock_handle: AtomicU16,
    /// Base priority (scheduler-owned; only read here)
    prio_base: AtomicU8,
    /// Kernel priority boost
    prio_boost: AtomicU8,
    /// Priority inherited from a lock-inheritance sleep queue
    prio_inherited: AtomicU8,
    refcount: AtomicU32,
    /// Sleep channel token while Sleeping (NO_WCHAN otherwise)
    wchan: AtomicU64,
    /// Tid of the task that has claimed the right to reap this one
    waiter: AtomicU64,
    exit_code: AtomicI32,
    name: Mutex<[u8; 16]>,
    cred: Mutex<Option<Cred>>,
    specific: Mutex<Option<BTreeMap<u32, SpecificSlot>>>,
    ctl_slot: Mutex<Option<CtlSlot>>,
    /// One-shot completion hook run at the next user-return boundary
    userret: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Task {
    /// Build a fresh TCB in the Idle state
    ///
    /// `lock` is the handle of the run-queue lock, which guards Idle and
    /// Runnable tasks.
    pub(crate) fn new(id: Tid, owner: Oid, lock: LockHandle, prio: Priority, cred: Cred) -> Self {
        Self {
            magic: AtomicU32::new(TASK_MAGIC),
            id,
            owner,
            state: AtomicU8::new(TaskState::Idle as u8),
            flags: AtomicU32::new(0),
            lock_handle: AtomicU16::new(lock.raw()),
            prio_base: AtomicU8::new(prio),
            prio_boost: AtomicU8::new(0),
            prio_inherited: AtomicU8::new(0),
            refcount: AtomicU32::new(0),
            wchan: AtomicU64::new(NO_WCHAN),
            waiter: AtomicU64::new(NO_WCHAN),
            exit_code: AtomicI32::new(0),
            name: Mutex::new([0; 16]),
            cred: Mutex::new(Some(cred)),
            specific: Mutex::new(None),
            ctl_slot: Mutex::new(None),
            userret: Mutex::new(None),
        }
    }

    /// Reinitialize a recycled TCB for its next incarnation
    ///
    /// Sub-objects that survive recycling (the name buffer, the specific
    /// data table allocation) are reused; everything else is reset as in
    /// `new`.
    pub(crate) fn reincarnate(&mut self, id: Tid, owner: Oid, lock: LockHandle, prio: Priority, cred: Cred) {
        self.magic.store(TASK_MAGIC, Ordering::Relaxed);
        self.id = id;
        self.owner = owner;
        self.state.store(TaskState::Idle as u8, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.lock_handle.store(lock.raw(), Ordering::Relaxed);
        self.prio_base.store(prio, Ordering::Relaxed);
        self.prio_boost.store(0, Ordering::Relaxed);
        self.prio_inherited.store(0, Ordering::Relaxed);
        self.refcount.store(0, Ordering::Relaxed);
        self.wchan.store(NO_WCHAN, Ordering::Relaxed);
        self.waiter.store(NO_WCHAN, Ordering::Relaxed);
        self.exit_code.store(0, Ordering::Relaxed);
        *self.name.lock() = [0; 16];
        *self.cred.lock() = Some(cred);
        *self.ctl_slot.lock() = None;
        *self.userret.lock() = None;
    }

    /// Task id, unique within the owner until the record is reaped
    #[inline]
    pub fn id(&self) -> Tid {
        self.id
    }

    /// Non-owning back-reference to the owner
    #[inline]
    pub fn owner(&self) -> Oid {
        self.owner
    }

    /// Current state (unordered snapshot; stable only under the task lock)
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Change state; requires the task's current lock
    pub fn set_state(&self, guard: &TaskLockGuard<'_>, state: TaskState) {
        debug_assert_eq!(guard.tid(), self.id, "guard is for a different task");
        self.state.store(state as u8, Ordering::Release);
    }

    /// Current flag snapshot
    #[inline]
    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set flag bits; requires the task's current lock
    pub fn set_flags(&self, guard: &TaskLockGuard<'_>, f: TaskFlags) {
        debug_assert_eq!(guard.tid(), self.id, "guard is for a different task");
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    /// Clear flag bits; requires the task's current lock
    pub fn clear_flags(&self, guard: &TaskLockGuard<'_>, f: TaskFlags) {
        debug_assert_eq!(guard.tid(), self.id, "guard is for a different task");
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    /// Mark a signal pending for this task
    ///
    /// Called by the signal service from any context; honored at the next
    /// safe point.
    pub fn post_signal(&self) {
        self.flags.fetch_or(TaskFlags::PENDSIG.bits(), Ordering::AcqRel);
    }

    /// Handle of the lock currently protecting this task
    #[inline]
    pub fn lock_handle(&self) -> LockHandle {
        LockHandle::from_raw(self.lock_handle.load(Ordering::Acquire))
    }

    /// Publish a new current lock; only `lock::assign_new_lock` calls this
    pub(crate) fn store_lock_handle(&self, h: LockHandle) {
        self.lock_handle.store(h.raw(), Ordering::Release);
    }

    /// Effective priority: the larger of the inherited priority and the
    /// boosted base priority
    pub fn effective_priority(&self) -> Priority {
        let base = self.prio_base.load(Ordering::Relaxed);
        let boost = self.prio_boost.load(Ordering::Relaxed);
        let inherited = self.prio_inherited.load(Ordering::Relaxed);
        base.saturating_add(boost).max(inherited)
    }

    /// Base priority class (used when inheriting into a new task)
    #[inline]
    pub fn base_priority(&self) -> Priority {
        self.prio_base.load(Ordering::Relaxed)
    }

    /// Sleep channel token, NO_WCHAN unless Sleeping
    #[inline]
    pub fn wchan(&self) -> u64 {
        self.wchan.load(Ordering::Acquire)
    }

    pub(crate) fn set_wchan(&self, guard: &TaskLockGuard<'_>, wchan: u64) {
        debug_assert_eq!(guard.tid(), self.id, "guard is for a different task");
        self.wchan.store(wchan, Ordering::Release);
    }

    /// Tid of the waiter that has claimed this task, or NO_WCHAN
    #[inline]
    pub fn waiter(&self) -> Tid {
        self.waiter.load(Ordering::Acquire)
    }

    /// Claim the right to reap this task (owner mutex held)
    ///
    /// Returns false if another waiter already holds the claim.
    pub(crate) fn claim_waiter(&self, who: Tid) -> bool {
        self.waiter
            .compare_exchange(NO_WCHAN, who, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| true)
            .unwrap_or_else(|cur| cur == who)
    }

    pub(crate) fn release_waiter(&self, who: Tid) {
        let _ = self
            .waiter
            .compare_exchange(who, NO_WCHAN, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Exit code stored when the task became a zombie
    #[inline]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Current reference count
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Take a reference, keeping the record alive for inspection
    ///
    /// Must be called with the owner mutex held. Taking a reference on a
    /// Zombie is a programmer error.
    pub fn addref(&self) {
        assert!(
            self.state() != TaskState::Zombie,
            "addref on zombie task {}",
            self.id
        );
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference taken with `addref`
    ///
    /// Returns the remaining count. The blocking wait-for-zero lives in
    /// `TaskManager::drain`, which also wakes the draining exiter.
    pub fn delref(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "refcount underflow on task {}", self.id);
        prev - 1
    }

    // =========================================================================
    // Specific data
    // =========================================================================

    /// Store a value in the task's private key/value slot table
    pub fn set_specific(&self, key: u32, slot: SpecificSlot) {
        let mut table = self.specific.lock();
        table.get_or_insert_with(BTreeMap::new).insert(key, slot);
    }

    /// Fetch a value from the slot table
    pub fn get_specific(&self, key: u32) -> Option<u64> {
        self.specific.lock().as_ref()?.get(&key).map(|s| s.value)
    }

    /// Destroy the slot table, running destructors
    ///
    /// Called once during exit while the task can still block, and again
    /// (idempotently) at free time.
    pub(crate) fn destroy_specific(&self) {
        let table = self.specific.lock().take();
        if let Some(table) = table {
            for (_, slot) in table {
                if let Some(dtor) = slot.dtor {
                    dtor(slot.value);
                }
            }
        }
    }

    // =========================================================================
    // Misc record plumbing
    // =========================================================================

    /// Set the task's debugging name (truncated to 15 bytes)
    pub fn set_name(&self, name: &str) {
        let mut buf = self.name.lock();
        *buf = [0; 16];
        let bytes = name.as_bytes();
        let len = bytes.len().min(15);
        buf[..len].copy_from_slice(&bytes[..len]);
    }

    /// Copy of the task's debugging name buffer
    pub fn name(&self) -> [u8; 16] {
        *self.name.lock()
    }

    /// Take the credentials for release at exit
    pub(crate) fn take_cred(&self) -> Option<Cred> {
        self.cred.lock().take()
    }

    /// Copy the credentials (for inheritance into a new task)
    pub fn cred(&self) -> Option<Cred> {
        *self.cred.lock()
    }

    pub(crate) fn ctl_slot(&self) -> Option<CtlSlot> {
        *self.ctl_slot.lock()
    }

    pub(crate) fn set_ctl_slot(&self, slot: Option<CtlSlot>) {
        *self.ctl_slot.lock() = slot;
    }

    /// Install the one-shot user-return hook and mark it pending
    ///
    /// The hook runs (and the want bit clears) the next time the task
    /// passes the user-return check.
    pub fn set_userret_hook(&self, guard: &TaskLockGuard<'_>, hook: Box<dyn FnOnce() + Send>) {
        debug_assert_eq!(guard.tid(), self.id, "guard is for a different task");
        *self.userret.lock() = Some(hook);
        self.flags
            .fetch_or(TaskFlags::WUSERRET.bits(), Ordering::AcqRel);
    }

    /// Take the pending user-return hook, if any
    pub(crate) fn take_userret_hook(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.userret.lock().take()
    }

    /// Verify and clear the record magic; panics on double free
    pub(crate) fn consume_magic(&self) {
        let prev = self.magic.swap(0, Ordering::AcqRel);
        assert_eq!(prev, TASK_MAGIC, "double free or corrupt TCB {}", self.id);
    }
}
