//! Lifecycle operations: create, start, suspend, resume, exit, wait
//!
//! `TaskManager` owns the lock registry, the owner table and the global
//! task registry, and drives every state-machine edge. CPU dispatch
//! policy stays behind the [`Scheduler`] seam; the manager only tells
//! the scheduler when a task becomes eligible or stops being eligible.
//!
//! ## Lock order
//!
//! - owner mutex strictly before any task lock
//! - per-processor lock -> wait-queue lock -> run-queue lock
//! - the global registry lock nests inside anything and takes nothing
//!
//! Blocking operations (`wait`, the refcount drain in `exit`, the
//! cooperative stop at the user-return boundary) are predicate loops on
//! the owner's change condvar.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::debug;
use spin::Mutex;

use crate::ctlblock::{CtlSlot, CTL_CPU_EXITED, CTL_CPU_NONE};
use crate::error::{Error, Result};
use crate::hooks::{CredHooks, DefaultHooks, ExitHooks, SignalAction, SignalHooks};
use crate::lock::LockRegistry;
use crate::owner::Owner;
use crate::sched::{Scheduler, SimpleScheduler};
use crate::sleepq::{SleepEntry, SleepQueue};
use crate::task::{
    Oid, Task, TaskFlags, TaskState, Tid, NO_WCHAN, PRIORITY_NORMAL,
};

/// Sleep-queue lock slots available by default
pub const DEFAULT_SLEEPQ_SLOTS: usize = 256;

/// Default cap on tasks per owner
pub const DEFAULT_MAX_TASKS: u32 = 2048;

bitflags! {
    /// Options for [`TaskManager::create`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// Reaped lazily; `wait` never returns this task
        const DETACHED = 1 << 0;
        /// Kernel-internal task
        const SYSTEM   = 1 << 1;
    }
}

bitflags! {
    /// Options for [`TaskManager::wait`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        /// Probe without blocking; `WouldBlock` when nothing is ready
        const NOHANG = 1 << 0;
    }
}

/// What the embedder should do after a user-return check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserReturn {
    /// All deferred work handled; the task continues to user level
    Resumed,
    /// The task exited; its context must not be resumed
    Exited,
}

/// The lifecycle core
pub struct TaskManager {
    locks: LockRegistry,
    /// Global id -> task map for introspection; zombies are absent
    registry: Mutex<BTreeMap<Tid, Arc<Task>>>,
    owners: Mutex<BTreeMap<Oid, Arc<Owner>>>,
    /// Registered sleep queues by wait channel
    sleepqs: Mutex<BTreeMap<u64, Arc<SleepQueue>>>,
    /// Reaped TCBs awaiting reincarnation
    recycle: Mutex<Vec<Task>>,
    sched: Arc<dyn Scheduler>,
    cred_hooks: Arc<dyn CredHooks>,
    signal_hooks: Arc<dyn SignalHooks>,
    exit_hooks: Arc<dyn ExitHooks>,
    next_tid: AtomicU64,
    next_oid: AtomicU64,
    max_tasks: u32,
}

impl TaskManager {
    /// Build a manager with the reference scheduler and no-op hooks
    pub fn new() -> Self {
        let hooks = Arc::new(DefaultHooks);
        Self::with_collaborators(
            Arc::new(SimpleScheduler::new()),
            hooks.clone(),
            hooks.clone(),
            hooks,
        )
    }

    /// Build a manager around external collaborators
    pub fn with_collaborators(
        sched: Arc<dyn Scheduler>,
        cred_hooks: Arc<dyn CredHooks>,
        signal_hooks: Arc<dyn SignalHooks>,
        exit_hooks: Arc<dyn ExitHooks>,
    ) -> Self {
        Self {
            locks: LockRegistry::new(DEFAULT_SLEEPQ_SLOTS),
            registry: Mutex::new(BTreeMap::new()),
            owners: Mutex::new(BTreeMap::new()),
            sleepqs: Mutex::new(BTreeMap::new()),
            recycle: Mutex::new(Vec::new()),
            sched,
            cred_hooks,
            signal_hooks,
            exit_hooks,
            next_tid: AtomicU64::new(1),
            next_oid: AtomicU64::new(1),
            max_tasks: DEFAULT_MAX_TASKS,
        }
    }

    /// The lock registry backing the dynamic lock-ownership protocol
    #[inline]
    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    // =========================================================================
    // Owners
    // =========================================================================

    /// Create a new empty owner (process)
    pub fn create_owner(&self) -> Arc<Owner> {
        let oid = self.next_oid.fetch_add(1, Ordering::Relaxed);
        let owner = Arc::new(Owner::new(oid));
        self.owners.lock().insert(oid, owner.clone());
        debug!("owner {}: created", oid);
        owner
    }

    /// Look up an owner by id
    pub fn owner(&self, oid: Oid) -> Option<Arc<Owner>> {
        self.owners.lock().get(&oid).cloned()
    }

    // =========================================================================
    // Create / start
    // =========================================================================

    /// Create a task in `owner`, in the Idle state
    ///
    /// Priority class and credentials are inherited from `template` when
    /// given. Collects the owner's pending detached zombie first, and
    /// reuses a recycled TCB when one is available.
    pub fn create(
        &self,
        owner: &Arc<Owner>,
        template: Option<&Task>,
        flags: CreateFlags,
    ) -> Result<Tid> {
        self.reap_pending_detached(owner);

        let prio = template.map(|t| t.base_priority()).unwrap_or(PRIORITY_NORMAL);
        let cred = template.and_then(|t| t.cred()).unwrap_or_default();
        let cred = self.cred_hooks.copy(&cred);
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let rq = self.locks.run_queue_handle();

        let task = match self.recycle.lock().pop() {
            Some(mut rec) => {
                rec.reincarnate(tid, owner.id(), rq, prio, cred);
                Arc::new(rec)
            }
            None => Arc::new(Task::new(tid, owner.id(), rq, prio, cred)),
        };

        let mut init = TaskFlags::empty();
        if flags.contains(CreateFlags::DETACHED) {
            init |= TaskFlags::DETACHED;
        }
        if flags.contains(CreateFlags::SYSTEM) {
            init |= TaskFlags::SYSTEM;
        }
        if !init.is_empty() {
            let guard = self.locks.lock_task(&task);
            task.set_flags(&guard, init);
        }

        {
            let mut st = owner.state.lock();
            if st.torn_down {
                drop(st);
                self.discard_stillborn(task);
                return Err(Error::NoProcess);
            }
            if st.tasks.len() as u32 >= self.max_tasks {
                drop(st);
                self.discard_stillborn(task);
                return Err(Error::OutOfMemory);
            }
            st.tasks.insert(tid, task.clone());
            st.nlive += 1;
        }
        self.registry.lock().insert(tid, task);
        debug!("task {}: created in owner {}", tid, owner.id());
        Ok(tid)
    }

    /// Unwind a record that never joined its owner: release the copied
    /// credentials and return the record to the recycle pool
    fn discard_stillborn(&self, task: Arc<Task>) {
        if let Some(cred) = task.take_cred() {
            self.cred_hooks.release(cred);
        }
        if let Ok(rec) = Arc::try_unwrap(task) {
            self.recycle.lock().push(rec);
        }
    }

    /// Make an Idle or Stopped task runnable
    pub fn start(&self, tid: Tid) -> Result<()> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;

        let mut st = owner.state.lock();
        let guard = self.locks.lock_task(&task);
        match task.state() {
            TaskState::Idle | TaskState::Stopped => {
                task.set_state(&guard, TaskState::Runnable);
                self.locks
                    .assign_new_lock(&task, guard, self.locks.run_queue_handle());
                st.nrunning += 1;
                drop(st);
                self.sched.enqueue(tid, task.effective_priority());
                owner.notify();
                Ok(())
            }
            TaskState::Runnable | TaskState::OnProcessor => Ok(()),
            TaskState::Zombie => Err(Error::NoProcess),
            TaskState::Sleeping | TaskState::Suspended => Err(Error::InvalidArgument),
        }
    }

    // =========================================================================
    // Suspend / resume
    // =========================================================================

    /// Request suspension of `target` on behalf of `caller`
    ///
    /// Sets the want-suspend bit; the target parks itself at its next
    /// safe point. An interruptible sleeper is kicked out of its sleep so
    /// it reaches that safe point promptly. Suspending anything while the
    /// caller itself is doomed (pending exit or core dump) would strand
    /// the owner, so it fails with `Deadlock` up front.
    pub fn suspend(&self, caller: Tid, target: Tid) -> Result<()> {
        let caller_task = self.find_by_id(caller).ok_or(Error::NoProcess)?;
        if caller_task
            .flags()
            .intersects(TaskFlags::WEXIT | TaskFlags::WCORE)
        {
            return Err(Error::Deadlock);
        }

        let task = self.find_by_id(target).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;

        let mut st = owner.state.lock();
        let guard = self.locks.lock_task(&task);
        match task.state() {
            TaskState::Idle | TaskState::Zombie => Err(Error::NoProcess),
            TaskState::Suspended => Ok(()),
            TaskState::Sleeping => {
                task.set_flags(&guard, TaskFlags::WSUSPEND);
                let wchan = task.wchan();
                drop(guard);
                let sq = self.sleepqs.lock().get(&wchan).cloned();
                if let Some(sq) = sq {
                    if sq.unsleep(&self.locks, &task, true).is_some() {
                        st.nrunning += 1;
                        self.sched.enqueue(target, task.effective_priority());
                    }
                }
                drop(st);
                owner.notify();
                Ok(())
            }
            TaskState::Runnable | TaskState::OnProcessor | TaskState::Stopped => {
                task.set_flags(&guard, TaskFlags::WSUSPEND);
                drop(guard);
                drop(st);
                owner.notify();
                Ok(())
            }
        }
    }

    /// Withdraw a suspension request and restart a Suspended task
    pub fn resume(&self, tid: Tid) -> Result<()> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;

        let mut st = owner.state.lock();
        let guard = self.locks.lock_task(&task);
        match task.state() {
            TaskState::Idle | TaskState::Zombie => Err(Error::NoProcess),
            TaskState::Suspended => {
                task.clear_flags(&guard, TaskFlags::WSUSPEND | TaskFlags::WCORE);
                task.set_state(&guard, TaskState::Runnable);
                self.locks
                    .assign_new_lock(&task, guard, self.locks.run_queue_handle());
                st.nrunning += 1;
                drop(st);
                self.sched.enqueue(tid, task.effective_priority());
                owner.notify();
                Ok(())
            }
            _ => {
                // Not yet parked: withdrawing the want bit is enough
                task.clear_flags(&guard, TaskFlags::WSUSPEND | TaskFlags::WCORE);
                drop(guard);
                drop(st);
                owner.notify();
                Ok(())
            }
        }
    }

    // =========================================================================
    // Exit / wait / free
    // =========================================================================

    /// Post an exit request; honored at the target's next safe point
    ///
    /// Kicks an interruptible sleeper and wakes any cooperative stop so
    /// the target reaches the user-return check.
    pub fn request_exit(&self, tid: Tid, code: i32) -> Result<()> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;
        task.set_exit_code(code);
        {
            let guard = self.locks.lock_task(&task);
            task.set_flags(&guard, TaskFlags::WEXIT);
        }
        self.kick_sleeper(&owner, &task);
        owner.notify();
        Ok(())
    }

    /// Post a core-dump request; the target parks Suspended at its next
    /// safe point until resumed
    pub fn request_core(&self, tid: Tid) -> Result<()> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;
        {
            let guard = self.locks.lock_task(&task);
            task.set_flags(&guard, TaskFlags::WCORE);
        }
        self.kick_sleeper(&owner, &task);
        owner.notify();
        Ok(())
    }

    /// Mark a signal pending and make sure the target notices
    pub fn post_signal(&self, tid: Tid) -> Result<()> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;
        task.post_signal();
        self.kick_sleeper(&owner, &task);
        owner.notify();
        Ok(())
    }

    /// Kick `task` out of an interruptible sleep, if it is in one
    fn kick_sleeper(&self, owner: &Owner, task: &Arc<Task>) {
        if task.state() != TaskState::Sleeping {
            return;
        }
        let wchan = task.wchan();
        let sq = self.sleepqs.lock().get(&wchan).cloned();
        if let Some(sq) = sq {
            let mut st = owner.state.lock();
            if sq.unsleep(&self.locks, task, true).is_some() {
                st.nrunning += 1;
                self.sched.enqueue(task.id(), task.effective_priority());
            }
        }
    }

    /// Terminate `tid` with `code`
    ///
    /// Called by the task itself at a safe point. Blocks until the
    /// task's reference count drains to zero. The exit that drops the
    /// owner's live count to zero also tears the whole owner down.
    pub fn exit(&self, tid: Tid, code: i32) -> Result<()> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;

        // Zombie accounting first, so a concurrent wait already sees one
        // more zombie on its way
        owner.state.lock().nzombies += 1;

        // The task can still block during these
        self.exit_hooks.emul_exit(&task);
        task.destroy_specific();
        if let Some(cred) = task.take_cred() {
            self.cred_hooks.release(cred);
        }
        self.registry.lock().remove(&tid);
        self.drain(&owner, &task);
        self.signal_hooks.propagate_exit(owner.id(), tid);

        let detached = task.flags().contains(TaskFlags::DETACHED);
        let last = {
            let mut st = owner.state.lock();
            let guard = self.locks.lock_task(&task);
            let prev = task.state();
            task.set_exit_code(code);
            if let Some(slot) = task.ctl_slot() {
                owner.ctl.publish_cpu(slot, CTL_CPU_EXITED);
            }
            task.clear_flags(&guard, TaskFlags::RUNNING);
            // A zombie keeps whichever lock it held at exit; nothing
            // contends for it past this point
            task.set_state(&guard, TaskState::Zombie);
            drop(guard);
            if prev == TaskState::Runnable {
                self.sched.dequeue(tid, task.effective_priority());
            }
            st.nlive -= 1;
            if prev.is_running() {
                st.nrunning -= 1;
            }
            if detached && st.pending_detached.is_none() {
                st.pending_detached = Some(tid);
            }
            // The live-count decrement and the last-task decision share
            // this critical section, so exactly one concurrent exit
            // observes the count hitting zero
            let last = st.nlive == 0 && !st.torn_down;
            if last {
                st.torn_down = true;
            }
            last
        };
        owner.notify();
        debug!("task {}: exited with code {}", tid, code);
        if last {
            debug!("task {}: last in owner {}, tearing down", tid, owner.id());
            self.exit_hooks.owner_teardown(owner.id());
            self.finish_teardown(&owner);
        }
        Ok(())
    }

    /// Reap the whole task set, remove the owner and unmap its
    /// control-block pages
    ///
    /// Runs once, from the exit that dropped the live count to zero;
    /// `torn_down` is already set, so no new task can join meanwhile.
    fn finish_teardown(&self, owner: &Arc<Owner>) {
        let victims: Vec<Arc<Task>> = {
            let mut st = owner.state.lock();
            st.nzombies = 0;
            st.nrunning = 0;
            st.pending_detached = None;
            let victims = st.tasks.values().cloned().collect();
            st.tasks.clear();
            victims
        };
        {
            let mut reg = self.registry.lock();
            for v in &victims {
                reg.remove(&v.id());
            }
        }
        for v in victims {
            self.free_record(owner, v, false);
        }
        owner.ctl.teardown();
        self.owners.lock().remove(&owner.id());
        owner.notify();
        debug!("owner {}: torn down", owner.id());
    }

    /// Block until `task`'s reference count reaches zero
    ///
    /// Holders drop their references via [`TaskManager::release`], which
    /// broadcasts the owner's change condvar.
    fn drain(&self, owner: &Owner, task: &Task) {
        let mut st = owner.state.lock();
        while task.refcount() > 0 {
            st = owner.change.wait(st, &owner.state);
        }
        drop(st);
    }

    /// Take a counted reference on a live task
    pub fn hold(&self, tid: Tid) -> Result<Arc<Task>> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;
        let _st = owner.state.lock();
        if task.state() == TaskState::Zombie {
            return Err(Error::NoProcess);
        }
        task.addref();
        Ok(task)
    }

    /// Drop a reference taken with [`TaskManager::hold`]
    pub fn release(&self, task: &Task) {
        if task.delref() == 0 {
            if let Some(owner) = self.owner(task.owner()) {
                owner.notify();
            }
        }
    }

    /// Wait for a task of the caller's owner to exit and reap it
    ///
    /// `target` of `None` accepts any non-detached zombie. Blocks on the
    /// owner's change condvar unless `NOHANG` is given. Errors:
    /// - `Deadlock`: self-target, mutual targeted wait, or every other
    ///   live task is itself blocked in wait
    /// - `NoProcess`: the targeted task does not exist in this owner
    /// - `InvalidArgument`: the targeted task belongs to another owner
    /// - `NoChild`: no task could ever satisfy an anonymous wait
    /// - `Interrupted`: the caller has a pending signal
    /// - `WouldBlock`: `NOHANG` and nothing ready
    pub fn wait(
        &self,
        caller: Tid,
        target: Option<Tid>,
        flags: WaitFlags,
    ) -> Result<(Tid, i32)> {
        let caller_task = self.find_by_id(caller).ok_or(Error::NoProcess)?;
        let owner = self.owner(caller_task.owner()).ok_or(Error::NoProcess)?;
        if target == Some(caller) {
            return Err(Error::Deadlock);
        }

        let release_claim = |st: &crate::owner::OwnerState| {
            if let Some(t) = target {
                if let Some(task) = st.tasks.get(&t) {
                    task.release_waiter(caller);
                }
            }
        };

        let mut st = owner.state.lock();
        loop {
            if st.torn_down {
                release_claim(&st);
                return Err(Error::NoChild);
            }

            // Detached zombies are collected lazily, before anything else
            let detached: Vec<Arc<Task>> = st
                .tasks
                .values()
                .filter(|t| {
                    t.state() == TaskState::Zombie && t.flags().contains(TaskFlags::DETACHED)
                })
                .cloned()
                .collect();
            if !detached.is_empty() {
                for t in &detached {
                    st.tasks.remove(&t.id());
                    st.nzombies -= 1;
                }
                st.pending_detached = None;
                drop(st);
                for t in detached {
                    debug!("task {}: detached zombie reaped", t.id());
                    self.free_record(&owner, t, true);
                }
                owner.notify();
                st = owner.state.lock();
                continue;
            }

            let candidate: Option<Arc<Task>> = match target {
                Some(t) => {
                    let Some(task) = st.tasks.get(&t).cloned() else {
                        // A live task of another owner is a malformed
                        // request, not a missing one
                        return Err(if self.find_by_id(t).is_some() {
                            Error::InvalidArgument
                        } else {
                            Error::NoProcess
                        });
                    };
                    if st.waiting_on.get(&t) == Some(&Some(caller)) {
                        return Err(Error::Deadlock);
                    }
                    if !task.claim_waiter(caller) {
                        // First waiter wins; block until the target is
                        // reaped or the claim is released
                        None
                    } else if task.state() == TaskState::Zombie {
                        Some(task)
                    } else {
                        None
                    }
                }
                None => st
                    .tasks
                    .values()
                    .find(|t| {
                        t.id() != caller
                            && t.state() == TaskState::Zombie
                            && !t.flags().contains(TaskFlags::DETACHED)
                            && (t.waiter() == NO_WCHAN || t.waiter() == caller)
                    })
                    .cloned()
                    .map(|t| {
                        t.claim_waiter(caller);
                        t
                    }),
            };

            if let Some(task) = candidate {
                let tid = task.id();
                let code = task.exit_code();
                st.tasks.remove(&tid);
                st.nzombies -= 1;
                drop(st);
                self.free_record(&owner, task, true);
                owner.notify();
                debug!("task {}: reaped by {} (code {})", tid, caller, code);
                return Ok((tid, code));
            }

            // Could any task ever satisfy this wait?
            let satisfiable = match target {
                Some(_) => true, // it exists and has not been reaped
                None => st
                    .tasks
                    .values()
                    .any(|t| t.id() != caller && !t.flags().contains(TaskFlags::DETACHED)),
            };
            if !satisfiable {
                return Err(Error::NoChild);
            }

            // Give up when every other unexited task is itself blocked in
            // wait; nobody is left to produce a zombie
            let others: Vec<Tid> = st
                .tasks
                .values()
                .filter(|t| t.id() != caller && t.state() != TaskState::Zombie)
                .map(|t| t.id())
                .collect();
            if !others.is_empty() && others.iter().all(|t| st.waiting_on.contains_key(t)) {
                release_claim(&st);
                return Err(Error::Deadlock);
            }

            if flags.contains(WaitFlags::NOHANG) {
                release_claim(&st);
                return Err(Error::WouldBlock);
            }
            if caller_task.flags().contains(TaskFlags::PENDSIG) {
                release_claim(&st);
                return Err(Error::Interrupted);
            }

            st.waiting_on.insert(caller, target);
            st.nwaiters += 1;
            st = owner.change.wait(st, &owner.state);
            st.nwaiters -= 1;
            st.waiting_on.remove(&caller);
        }
    }

    /// Collect the owner's fast-path pending detached zombie, if any
    fn reap_pending_detached(&self, owner: &Owner) {
        let victim: Option<Arc<Task>> = {
            let mut st = owner.state.lock();
            let tid = match st.pending_detached.take() {
                Some(t) => t,
                None => return,
            };
            match st.tasks.get(&tid) {
                Some(t) if t.state() == TaskState::Zombie => {
                    let t = t.clone();
                    st.tasks.remove(&tid);
                    st.nzombies -= 1;
                    Some(t)
                }
                _ => None,
            }
        };
        if let Some(t) = victim {
            debug!("task {}: detached zombie reaped", t.id());
            self.free_record(owner, t, true);
        }
    }

    /// Final teardown of a reaped record
    ///
    /// Verifies and clears the record magic (double free panics), gives
    /// back the control-block slot, and feeds the record to the recycle
    /// pool for the next create.
    fn free_record(&self, owner: &Owner, task: Arc<Task>, recycle: bool) {
        owner.ctl.free(&task);
        task.destroy_specific();
        task.consume_magic();
        if recycle {
            if let Ok(rec) = Arc::try_unwrap(task) {
                self.recycle.lock().push(rec);
            }
        }
    }

    // =========================================================================
    // Lookup / introspection
    // =========================================================================

    /// Registry lookup; zombies are not found
    pub fn find_by_id(&self, tid: Tid) -> Option<Arc<Task>> {
        self.registry.lock().get(&tid).cloned()
    }

    /// Visit a snapshot of every registered task
    pub fn for_each_task(&self, mut f: impl FnMut(&Arc<Task>)) {
        let snapshot: Vec<Arc<Task>> = self.registry.lock().values().cloned().collect();
        for t in &snapshot {
            f(t);
        }
    }

    /// Number of registered (non-zombie) tasks
    pub fn task_count(&self) -> usize {
        self.registry.lock().len()
    }

    // =========================================================================
    // Sleep queues
    // =========================================================================

    /// Register a sleep queue for `wchan`
    pub fn create_sleep_queue(&self, wchan: u64) -> Result<Arc<SleepQueue>> {
        let mut map = self.sleepqs.lock();
        if map.contains_key(&wchan) {
            return Err(Error::InvalidArgument);
        }
        let sq = Arc::new(SleepQueue::new(&self.locks, wchan)?);
        map.insert(wchan, sq.clone());
        Ok(sq)
    }

    /// Look up a registered sleep queue
    pub fn sleep_queue(&self, wchan: u64) -> Option<Arc<SleepQueue>> {
        self.sleepqs.lock().get(&wchan).cloned()
    }

    /// Park the running task `tid` on `wchan`
    ///
    /// Returns the entry whose [`SleepEntry::block`] the task then calls.
    pub fn sleep_on(&self, wchan: u64, tid: Tid, interruptible: bool) -> Result<Arc<SleepEntry>> {
        let sq = self.sleep_queue(wchan).ok_or(Error::InvalidArgument)?;
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;

        let mut st = owner.state.lock();
        let guard = self.locks.lock_task(&task);
        let prev = task.state();
        if !prev.is_running() {
            return Err(Error::InvalidArgument);
        }
        task.clear_flags(&guard, TaskFlags::RUNNING);
        let entry = sq.enqueue(&self.locks, &task, guard, interruptible);
        if prev == TaskState::Runnable {
            self.sched.dequeue(tid, task.effective_priority());
        }
        st.nrunning -= 1;
        drop(st);
        owner.notify();
        Ok(entry)
    }

    /// Wake the longest-parked task on `wchan`
    pub fn wake_one(&self, wchan: u64) -> Result<Option<Tid>> {
        let sq = self.sleep_queue(wchan).ok_or(Error::InvalidArgument)?;
        let entry = sq.wake_one(&self.locks, |tid| self.find_by_id(tid));
        let Some(entry) = entry else {
            return Ok(None);
        };
        if let Some(task) = self.find_by_id(entry.tid()) {
            if let Some(owner) = self.owner(task.owner()) {
                owner.state.lock().nrunning += 1;
                owner.notify();
            }
            self.sched.enqueue(task.id(), task.effective_priority());
        }
        Ok(Some(entry.tid()))
    }

    /// Wake every task parked on `wchan`; returns how many
    pub fn wake_all(&self, wchan: u64) -> Result<usize> {
        let mut n = 0;
        while self.wake_one(wchan)?.is_some() {
            n += 1;
        }
        Ok(n)
    }

    // =========================================================================
    // Dispatch notifications
    // =========================================================================

    /// The scheduler picked `tid` to run on `cpu`
    ///
    /// Hands the task's lock to the processor's lock and publishes the
    /// processor id through the task's control block, if it has one.
    pub fn on_dispatch(&self, tid: Tid, cpu: u32) -> Result<()> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;
        let guard = self.locks.lock_task(&task);
        if task.state() != TaskState::Runnable {
            return Err(Error::InvalidArgument);
        }
        task.set_state(&guard, TaskState::OnProcessor);
        task.set_flags(&guard, TaskFlags::RUNNING);
        self.locks
            .assign_new_lock(&task, guard, self.locks.processor_handle(cpu));
        if let Some(slot) = task.ctl_slot() {
            owner.ctl.publish_cpu(slot, cpu as i32);
        }
        Ok(())
    }

    /// `tid` was preempted; it goes back on the run queue
    pub fn on_deschedule(&self, tid: Tid) -> Result<()> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;
        let guard = self.locks.lock_task(&task);
        if task.state() != TaskState::OnProcessor {
            return Err(Error::InvalidArgument);
        }
        task.clear_flags(&guard, TaskFlags::RUNNING);
        task.set_state(&guard, TaskState::Runnable);
        self.locks
            .assign_new_lock(&task, guard, self.locks.run_queue_handle());
        if let Some(slot) = task.ctl_slot() {
            owner.ctl.publish_cpu(slot, CTL_CPU_NONE);
        }
        self.sched.enqueue(tid, task.effective_priority());
        Ok(())
    }

    /// Reserve a control-block record for `tid` in its owner's pool
    pub fn ctl_attach(&self, tid: Tid) -> Result<CtlSlot> {
        let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
        let owner = self.owner(task.owner()).ok_or(Error::NoProcess)?;
        owner.ctl.alloc(&task)
    }

    // =========================================================================
    // User-return boundary
    // =========================================================================

    /// Handle deferred work before `tid` returns to user level
    ///
    /// Loops until no want bits remain: delivers pending signals, honors
    /// exit and core-dump requests, parks the task when suspension was
    /// requested, and runs the one-shot user-return hook. Called by the
    /// task itself; may block in the cooperative stop states.
    pub fn user_return(&self, tid: Tid) -> Result<UserReturn> {
        loop {
            let task = self.find_by_id(tid).ok_or(Error::NoProcess)?;
            let f = task.flags();
            if !f.intersects(
                TaskFlags::PENDSIG
                    | TaskFlags::WEXIT
                    | TaskFlags::WCORE
                    | TaskFlags::WSUSPEND
                    | TaskFlags::WUSERRET,
            ) {
                return Ok(UserReturn::Resumed);
            }

            if f.contains(TaskFlags::PENDSIG) {
                {
                    let guard = self.locks.lock_task(&task);
                    task.clear_flags(&guard, TaskFlags::PENDSIG);
                }
                match self.signal_hooks.deliver_pending(&task) {
                    SignalAction::Delivered => {}
                    SignalAction::Stop => self.stop_self(&task, TaskState::Stopped),
                    SignalAction::Kill(code) => {
                        self.exit(tid, code)?;
                        return Ok(UserReturn::Exited);
                    }
                }
                continue;
            }

            // Exit outranks suspension: a doomed task must not park
            if f.contains(TaskFlags::WEXIT) {
                let code = task.exit_code();
                self.exit(tid, code)?;
                return Ok(UserReturn::Exited);
            }

            if f.intersects(TaskFlags::WCORE | TaskFlags::WSUSPEND) {
                self.stop_self(&task, TaskState::Suspended);
                continue;
            }

            if f.contains(TaskFlags::WUSERRET) {
                let hook = task.take_userret_hook();
                {
                    let guard = self.locks.lock_task(&task);
                    task.clear_flags(&guard, TaskFlags::WUSERRET);
                }
                if let Some(hook) = hook {
                    hook();
                }
                continue;
            }
        }
    }

    /// Park the calling task in a cooperative stop state until restarted
    fn stop_self(&self, task: &Arc<Task>, state: TaskState) {
        let Some(owner) = self.owner(task.owner()) else {
            return;
        };
        let mut st = owner.state.lock();
        {
            let guard = self.locks.lock_task(task);
            // The request may have been withdrawn before we got here
            if state == TaskState::Suspended
                && !task
                    .flags()
                    .intersects(TaskFlags::WSUSPEND | TaskFlags::WCORE)
            {
                return;
            }
            let prev = task.state();
            task.clear_flags(&guard, TaskFlags::RUNNING);
            task.set_state(&guard, state);
            drop(guard);
            if prev == TaskState::Runnable {
                self.sched.dequeue(task.id(), task.effective_priority());
            }
            if prev.is_running() {
                st.nrunning -= 1;
            }
        }
        owner.notify();
        debug!("task {}: stopped ({:?})", task.id(), state);

        // Block at the safe point; an exit request overrides the stop
        while task.state() == state && !task.flags().contains(TaskFlags::WEXIT) {
            st = owner.change.wait(st, &owner.state);
        }
        drop(st);
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Cred, SignalHooks};
    use crate::sleepq::ParkOutcome;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AOrdering};
    use std::time::Duration;

    /// Manager plus an owner with one started "main" task
    fn setup() -> (Arc<TaskManager>, Arc<Owner>, Tid) {
        let mgr = Arc::new(TaskManager::new());
        let owner = mgr.create_owner();
        let main = mgr.create(&owner, None, CreateFlags::empty()).unwrap();
        mgr.start(main).unwrap();
        (mgr, owner, main)
    }

    fn spawn_started(mgr: &TaskManager, owner: &Arc<Owner>) -> Tid {
        let tid = mgr.create(owner, None, CreateFlags::empty()).unwrap();
        mgr.start(tid).unwrap();
        tid
    }

    fn wait_until(pred: impl Fn() -> bool) {
        while !pred() {
            std::thread::yield_now();
        }
    }

    #[test]
    fn create_is_idle_until_started() {
        let mgr = TaskManager::new();
        let owner = mgr.create_owner();
        let tid = mgr.create(&owner, None, CreateFlags::empty()).unwrap();

        let task = mgr.find_by_id(tid).unwrap();
        assert_eq!(task.state(), TaskState::Idle);
        let c = owner.counts();
        assert_eq!((c.live, c.running), (1, 0));

        mgr.start(tid).unwrap();
        assert_eq!(task.state(), TaskState::Runnable);
        assert_eq!(owner.counts().running, 1);
    }

    #[test]
    fn create_inherits_from_template() {
        let (mgr, owner, main) = setup();
        let template = mgr.find_by_id(main).unwrap();
        let tid = mgr
            .create(&owner, Some(&template), CreateFlags::DETACHED)
            .unwrap();
        let task = mgr.find_by_id(tid).unwrap();
        assert_eq!(task.base_priority(), template.base_priority());
        assert_eq!(task.cred(), template.cred());
        assert!(task.flags().contains(TaskFlags::DETACHED));
    }

    /// A create that fails after copying credentials must hand them back
    /// through the release hook rather than strand them on the record.
    #[test]
    fn failed_create_releases_copied_credentials() {
        struct CountingCreds {
            copies: AtomicU32,
            releases: AtomicU32,
        }
        impl CredHooks for CountingCreds {
            fn copy(&self, template: &Cred) -> Cred {
                self.copies.fetch_add(1, AOrdering::Relaxed);
                *template
            }
            fn release(&self, _cred: Cred) {
                self.releases.fetch_add(1, AOrdering::Relaxed);
            }
        }

        let creds = Arc::new(CountingCreds {
            copies: AtomicU32::new(0),
            releases: AtomicU32::new(0),
        });
        let hooks = Arc::new(DefaultHooks);
        let mgr = TaskManager::with_collaborators(
            Arc::new(SimpleScheduler::new()),
            creds.clone(),
            hooks.clone(),
            hooks,
        );
        let owner = mgr.create_owner();
        let t1 = mgr.create(&owner, None, CreateFlags::empty()).unwrap();
        mgr.start(t1).unwrap();
        mgr.exit(t1, 0).unwrap();

        // The owner is gone; a late create must unwind its half-built
        // record completely
        assert!(matches!(
            mgr.create(&owner, None, CreateFlags::empty()),
            Err(Error::NoProcess)
        ));
        assert_eq!(creds.copies.load(AOrdering::Relaxed), 2);
        assert_eq!(creds.releases.load(AOrdering::Relaxed), 2);
        assert_eq!(mgr.task_count(), 0);
    }

    #[test]
    fn exit_of_last_task_tears_down_owner() {
        let mgr = TaskManager::new();
        let owner = mgr.create_owner();
        let oid = owner.id();
        let tid = mgr.create(&owner, None, CreateFlags::empty()).unwrap();
        mgr.start(tid).unwrap();
        mgr.ctl_attach(tid).unwrap();
        assert_eq!(owner.ctl_pool().page_count(), 1);

        mgr.exit(tid, 0).unwrap();
        assert!(mgr.owner(oid).is_none());
        assert!(mgr.find_by_id(tid).is_none());
        assert_eq!(owner.ctl_pool().page_count(), 0);
        assert_eq!(mgr.task_count(), 0);
    }

    /// Two tasks exiting at once: the exit that finishes second must be
    /// the one that tears the owner down, even when the first is stalled
    /// mid-exit by an outstanding reference.
    #[test]
    fn overlapping_exits_tear_down_owner() {
        let mgr = Arc::new(TaskManager::new());
        let owner = mgr.create_owner();
        let oid = owner.id();
        let t1 = spawn_started(&mgr, &owner);
        let t2 = spawn_started(&mgr, &owner);

        // Pin t1 mid-exit in its reference drain
        let held = mgr.hold(t1).unwrap();
        let exiter = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.exit(t1, 0).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!exiter.is_finished());

        // t2 exits fully while t1 is still live; the owner must survive
        mgr.exit(t2, 0).unwrap();
        assert!(mgr.owner(oid).is_some());
        assert_eq!(owner.counts().live, 1);

        mgr.release(&held);
        exiter.join().unwrap();
        assert!(mgr.owner(oid).is_none());
        assert_eq!(owner.counts().total, 0);
        assert_eq!(mgr.task_count(), 0);
    }

    /// Two exited tasks are reaped by two waits; a third probe finds
    /// nothing ready.
    #[test]
    fn wait_reaps_zombies_then_probe_would_block() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        let t3 = spawn_started(&mgr, &owner);
        mgr.exit(t2, 2).unwrap();
        mgr.exit(t3, 3).unwrap();
        assert_eq!(owner.counts().zombies, 2);

        let mut reaped = BTreeSet::new();
        let (a, code_a) = mgr.wait(main, None, WaitFlags::empty()).unwrap();
        let (b, code_b) = mgr.wait(main, None, WaitFlags::empty()).unwrap();
        reaped.insert((a, code_a));
        reaped.insert((b, code_b));
        assert_eq!(reaped, BTreeSet::from([(t2, 2), (t3, 3)]));
        assert_eq!(owner.counts().zombies, 0);

        // Only the caller is left alive: nothing could ever match
        assert_eq!(
            mgr.wait(main, None, WaitFlags::NOHANG),
            Err(Error::NoChild)
        );
    }

    #[test]
    fn nohang_probe_with_live_candidate_would_block() {
        let (mgr, _owner, main) = setup();
        let t2 = spawn_started(&mgr, &_owner);
        assert_eq!(
            mgr.wait(main, Some(t2), WaitFlags::NOHANG),
            Err(Error::WouldBlock)
        );
        // The failed probe must not leave a stale claim behind
        assert_eq!(mgr.find_by_id(t2).unwrap().waiter(), NO_WCHAN);
    }

    #[test]
    fn wait_errors() {
        let (mgr, owner, main) = setup();
        assert_eq!(
            mgr.wait(main, Some(main), WaitFlags::empty()),
            Err(Error::Deadlock)
        );
        assert_eq!(
            mgr.wait(main, Some(9999), WaitFlags::empty()),
            Err(Error::NoProcess)
        );

        // Targeting another owner's task is malformed, not missing
        let other = mgr.create_owner();
        let foreign = mgr.create(&other, None, CreateFlags::empty()).unwrap();
        assert_eq!(
            mgr.wait(main, Some(foreign), WaitFlags::empty()),
            Err(Error::InvalidArgument)
        );
        drop(owner);
    }

    #[test]
    fn wait_interrupted_by_pending_signal() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        mgr.post_signal(main).unwrap();
        assert_eq!(
            mgr.wait(main, Some(t2), WaitFlags::empty()),
            Err(Error::Interrupted)
        );
        assert_eq!(mgr.find_by_id(t2).unwrap().waiter(), NO_WCHAN);
    }

    #[test]
    fn targeted_wait_returns_exit_code() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        mgr.exit(t2, 42).unwrap();
        assert_eq!(mgr.wait(main, Some(t2), WaitFlags::empty()), Ok((t2, 42)));
    }

    /// N concurrent anonymous waiters over N zombies: every zombie is
    /// reaped exactly once.
    #[test]
    fn no_double_reap_under_concurrent_waiters() {
        let (mgr, owner, _main) = setup();
        let waiters: Vec<Tid> = (0..4).map(|_| spawn_started(&mgr, &owner)).collect();
        let workers: Vec<Tid> = (0..4).map(|_| spawn_started(&mgr, &owner)).collect();
        for (i, &w) in workers.iter().enumerate() {
            mgr.exit(w, i as i32).unwrap();
        }

        let handles: Vec<_> = waiters
            .iter()
            .map(|&caller| {
                let mgr = mgr.clone();
                std::thread::spawn(move || mgr.wait(caller, None, WaitFlags::empty()).unwrap())
            })
            .collect();
        let reaped: BTreeSet<Tid> = handles
            .into_iter()
            .map(|h| h.join().unwrap().0)
            .collect();
        assert_eq!(reaped, workers.iter().copied().collect::<BTreeSet<Tid>>());
        assert_eq!(owner.counts().zombies, 0);
    }

    #[test]
    fn detached_zombie_collected_lazily_by_create() {
        let (mgr, owner, _main) = setup();
        let d = mgr.create(&owner, None, CreateFlags::DETACHED).unwrap();
        mgr.start(d).unwrap();
        mgr.exit(d, 0).unwrap();
        assert_eq!(owner.counts().zombies, 1);

        // The next create collects it before allocating
        let t = mgr.create(&owner, None, CreateFlags::empty()).unwrap();
        let c = owner.counts();
        assert_eq!(c.zombies, 0);
        assert_eq!(c.total, 2); // main + the new task
        assert!(mgr.find_by_id(t).is_some());
    }

    #[test]
    fn mutual_targeted_wait_is_deadlock() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);

        let first = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.wait(main, Some(t2), WaitFlags::empty()))
        };
        wait_until(|| owner.counts().waiters == 1);

        assert_eq!(
            mgr.wait(t2, Some(main), WaitFlags::empty()),
            Err(Error::Deadlock)
        );

        // Unwind the first waiter
        mgr.exit(t2, 5).unwrap();
        assert_eq!(first.join().unwrap(), Ok((t2, 5)));
    }

    #[test]
    fn anonymous_wait_gives_up_when_everyone_waits() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);

        let first = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.wait(main, None, WaitFlags::empty()))
        };
        wait_until(|| owner.counts().waiters == 1);

        // The only other live task is already blocked in wait
        assert_eq!(mgr.wait(t2, None, WaitFlags::empty()), Err(Error::Deadlock));

        mgr.exit(t2, 1).unwrap();
        assert_eq!(first.join().unwrap(), Ok((t2, 1)));
    }

    /// Suspension of a sleeper lands at the safe point, not in the sleep:
    /// the kick makes the task runnable with the want bit set, and the
    /// task parks itself at its next user-return check.
    #[test]
    fn suspend_of_interruptible_sleeper_lands_at_safe_point() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        mgr.create_sleep_queue(0x51ee).unwrap();
        let entry = mgr.sleep_on(0x51ee, t2, true).unwrap();
        assert_eq!(owner.counts().running, 1); // only main

        mgr.suspend(main, t2).unwrap();
        let task = mgr.find_by_id(t2).unwrap();
        assert_eq!(entry.block(), ParkOutcome::Interrupted);
        assert_eq!(task.state(), TaskState::Runnable);
        assert!(task.flags().contains(TaskFlags::WSUSPEND));

        // The task reaches its safe point and parks
        let runner = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.user_return(t2))
        };
        wait_until(|| mgr.find_by_id(t2).unwrap().state() == TaskState::Suspended);
        assert_eq!(owner.counts().running, 1);

        mgr.resume(t2).unwrap();
        assert_eq!(runner.join().unwrap(), Ok(UserReturn::Resumed));
        assert_eq!(mgr.find_by_id(t2).unwrap().state(), TaskState::Runnable);
    }

    #[test]
    fn suspend_of_non_interruptible_sleeper_defers_the_kick() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        mgr.create_sleep_queue(0xd15c).unwrap();
        mgr.sleep_on(0xd15c, t2, false).unwrap();

        mgr.suspend(main, t2).unwrap();
        let task = mgr.find_by_id(t2).unwrap();
        assert_eq!(task.state(), TaskState::Sleeping);
        assert!(task.flags().contains(TaskFlags::WSUSPEND));

        // The want bit is honored once the real wakeup arrives
        assert_eq!(mgr.wake_one(0xd15c).unwrap(), Some(t2));
        assert_eq!(task.state(), TaskState::Runnable);
        assert!(task.flags().contains(TaskFlags::WSUSPEND));
        drop(owner);
    }

    /// Self-suspension while an exit is pending can never be satisfied.
    #[test]
    fn suspend_self_with_pending_exit_is_deadlock() {
        let (mgr, _owner, _main) = setup();
        let t2 = spawn_started(&mgr, &_owner);
        mgr.request_exit(t2, 0).unwrap();
        assert_eq!(mgr.suspend(t2, t2), Err(Error::Deadlock));
    }

    #[test]
    fn suspend_state_errors() {
        let (mgr, owner, main) = setup();
        let idle = mgr.create(&owner, None, CreateFlags::empty()).unwrap();
        assert_eq!(mgr.suspend(main, idle), Err(Error::NoProcess));
        assert_eq!(mgr.suspend(main, 9999), Err(Error::NoProcess));
        assert_eq!(mgr.resume(9999), Err(Error::NoProcess));
    }

    #[test]
    fn resume_before_safe_point_withdraws_the_request() {
        let (mgr, _owner, main) = setup();
        let t2 = spawn_started(&mgr, &_owner);
        mgr.suspend(main, t2).unwrap();
        let task = mgr.find_by_id(t2).unwrap();
        assert!(task.flags().contains(TaskFlags::WSUSPEND));

        mgr.resume(t2).unwrap();
        assert!(!task.flags().contains(TaskFlags::WSUSPEND));
        // The withdrawn request must not park the task
        assert_eq!(mgr.user_return(t2), Ok(UserReturn::Resumed));
        assert_eq!(task.state(), TaskState::Runnable);
    }

    #[test]
    fn request_exit_honored_at_user_return() {
        let (mgr, _owner, main) = setup();
        let t2 = spawn_started(&mgr, &_owner);
        mgr.request_exit(t2, 7).unwrap();
        assert_eq!(mgr.user_return(t2), Ok(UserReturn::Exited));
        assert_eq!(mgr.wait(main, Some(t2), WaitFlags::empty()), Ok((t2, 7)));
    }

    #[test]
    fn exit_request_overrides_pending_suspension() {
        let (mgr, _owner, main) = setup();
        let t2 = spawn_started(&mgr, &_owner);
        mgr.suspend(main, t2).unwrap();
        mgr.request_exit(t2, 9).unwrap();
        // Both bits pending: the task must exit, not park
        assert_eq!(mgr.user_return(t2), Ok(UserReturn::Exited));
        assert_eq!(mgr.wait(main, Some(t2), WaitFlags::empty()), Ok((t2, 9)));
    }

    #[test]
    fn userret_hook_runs_once() {
        let (mgr, _owner, main) = setup();
        let task = mgr.find_by_id(main).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            let guard = mgr.locks().lock_task(&task);
            task.set_userret_hook(
                &guard,
                Box::new(move || {
                    ran.store(true, AOrdering::SeqCst);
                }),
            );
        }
        assert!(task.flags().contains(TaskFlags::WUSERRET));
        assert_eq!(mgr.user_return(main), Ok(UserReturn::Resumed));
        assert!(ran.load(AOrdering::SeqCst));
        assert!(!task.flags().contains(TaskFlags::WUSERRET));
    }

    struct KillOnSignal;

    impl SignalHooks for KillOnSignal {
        fn deliver_pending(&self, _task: &Task) -> SignalAction {
            SignalAction::Kill(9)
        }
    }

    #[test]
    fn fatal_signal_exits_through_user_return() {
        let hooks = Arc::new(DefaultHooks);
        let mgr = Arc::new(TaskManager::with_collaborators(
            Arc::new(SimpleScheduler::new()),
            hooks.clone(),
            Arc::new(KillOnSignal),
            hooks,
        ));
        let owner = mgr.create_owner();
        let main = mgr.create(&owner, None, CreateFlags::empty()).unwrap();
        mgr.start(main).unwrap();
        let t2 = spawn_started(&mgr, &owner);

        mgr.post_signal(t2).unwrap();
        assert_eq!(mgr.user_return(t2), Ok(UserReturn::Exited));
        assert_eq!(mgr.wait(main, Some(t2), WaitFlags::empty()), Ok((t2, 9)));
    }

    /// Exit blocks in the refcount drain until the last holder releases.
    #[test]
    fn exit_drains_references_before_zombifying() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        let held = mgr.hold(t2).unwrap();
        assert_eq!(held.refcount(), 1);

        let exiter = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.exit(t2, 0).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!exiter.is_finished());
        assert_ne!(held.state(), TaskState::Zombie);

        mgr.release(&held);
        exiter.join().unwrap();
        assert_eq!(held.state(), TaskState::Zombie);
        assert_eq!(mgr.wait(main, Some(t2), WaitFlags::empty()).unwrap().0, t2);
    }

    #[test]
    fn hold_refuses_zombies() {
        let (mgr, _owner, _main) = setup();
        let t2 = spawn_started(&mgr, &_owner);
        mgr.exit(t2, 0).unwrap();
        // Zombies leave the registry at exit
        assert!(matches!(mgr.hold(t2), Err(Error::NoProcess)));
    }

    #[test]
    fn dispatch_publishes_through_control_block() {
        let (mgr, owner, _main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        let slot = mgr.ctl_attach(t2).unwrap();
        let pool = owner.ctl_pool();
        assert_eq!(
            pool.block(slot).curcpu.load(AOrdering::Relaxed),
            CTL_CPU_NONE
        );

        mgr.on_dispatch(t2, 3).unwrap();
        let task = mgr.find_by_id(t2).unwrap();
        assert_eq!(task.state(), TaskState::OnProcessor);
        assert_eq!(task.lock_handle(), mgr.locks().processor_handle(3));
        assert_eq!(pool.block(slot).curcpu.load(AOrdering::Relaxed), 3);
        assert_eq!(pool.block(slot).pctr.load(AOrdering::Relaxed), 1);

        mgr.on_deschedule(t2).unwrap();
        assert_eq!(task.state(), TaskState::Runnable);
        assert_eq!(task.lock_handle(), mgr.locks().run_queue_handle());
        assert_eq!(
            pool.block(slot).curcpu.load(AOrdering::Relaxed),
            CTL_CPU_NONE
        );

        mgr.exit(t2, 0).unwrap();
        assert_eq!(
            pool.block(slot).curcpu.load(AOrdering::Relaxed),
            CTL_CPU_EXITED
        );
    }

    #[test]
    fn reaped_record_is_recycled() {
        let (mgr, owner, main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        mgr.find_by_id(t2).unwrap().set_name("short-lived");
        mgr.exit(t2, 0).unwrap();
        mgr.wait(main, Some(t2), WaitFlags::empty()).unwrap();

        // The recycled record comes back pristine
        let t3 = mgr.create(&owner, None, CreateFlags::empty()).unwrap();
        let task = mgr.find_by_id(t3).unwrap();
        assert_eq!(task.state(), TaskState::Idle);
        assert_eq!(task.name(), [0u8; 16]);
        assert_eq!(task.refcount(), 0);
        assert_eq!(task.flags(), TaskFlags::empty());
    }

    #[test]
    fn sleep_and_wake_round_trip_fix_counters() {
        let (mgr, owner, _main) = setup();
        let t2 = spawn_started(&mgr, &owner);
        assert_eq!(owner.counts().running, 2);

        mgr.create_sleep_queue(0xaaaa).unwrap();
        let entry = mgr.sleep_on(0xaaaa, t2, true).unwrap();
        assert_eq!(owner.counts().running, 1);
        assert_eq!(mgr.find_by_id(t2).unwrap().state(), TaskState::Sleeping);

        assert_eq!(mgr.wake_one(0xaaaa).unwrap(), Some(t2));
        assert_eq!(entry.block(), ParkOutcome::Woken);
        assert_eq!(owner.counts().running, 2);
        assert_eq!(mgr.wake_one(0xaaaa).unwrap(), None);
    }

    #[test]
    fn duplicate_sleep_queue_channel_rejected() {
        let mgr = TaskManager::new();
        mgr.create_sleep_queue(1).unwrap();
        assert!(matches!(
            mgr.create_sleep_queue(1),
            Err(Error::InvalidArgument)
        ));
        assert!(mgr.sleep_queue(1).is_some());
        assert!(mgr.sleep_queue(2).is_none());
    }

    #[test]
    fn registry_snapshot_sees_all_live_tasks() {
        let (mgr, owner, _main) = setup();
        spawn_started(&mgr, &owner);
        spawn_started(&mgr, &owner);
        let mut n = 0;
        mgr.for_each_task(|t| {
            assert_ne!(t.state(), TaskState::Zombie);
            n += 1;
        });
        assert_eq!(n, 3);
        assert_eq!(mgr.task_count(), 3);
    }
}
