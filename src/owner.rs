//! Owner (process) control block
//!
//! An owner holds the authoritative set of its tasks, aggregate
//! counters, a coarse owner mutex guarding both, and a broadcast condvar
//! signalled whenever a task's state, refcount or membership changes in
//! a way a collector might care about. The owner mutex is always taken
//! before any task's own lock, never after.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::condvar::CondVar;
use crate::ctlblock::CtlPool;
use crate::task::{Oid, Task, Tid};

/// State guarded by the owner mutex
pub(crate) struct OwnerState {
    /// Authoritative task set
    pub tasks: BTreeMap<Tid, Arc<Task>>,
    /// Tasks that have not reached Zombie (including Idle)
    pub nlive: u32,
    /// Zombies awaiting reap
    pub nzombies: u32,
    /// Runnable-or-running tasks
    pub nrunning: u32,
    /// Callers blocked in wait
    pub nwaiters: u32,
    /// At most one fast-path detached zombie awaiting lazy collection
    pub pending_detached: Option<Tid>,
    /// While a task is blocked in wait: its target (None = any)
    ///
    /// Consulted for deadlock detection and the all-waiting giveup.
    pub waiting_on: BTreeMap<Tid, Option<Tid>>,
    /// Set once the teardown path has run
    pub torn_down: bool,
}

/// Aggregate counter snapshot (diagnostics and tests)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerCounts {
    pub total: u32,
    pub live: u32,
    pub zombies: u32,
    pub running: u32,
    pub waiters: u32,
}

/// Process control block: owns the storage of its tasks
pub struct Owner {
    id: Oid,
    pub(crate) state: Mutex<OwnerState>,
    /// Broadcast on any change a collector might care about
    pub(crate) change: CondVar,
    /// Shared control-block pool, torn down with the owner
    pub(crate) ctl: CtlPool,
}

impl Owner {
    pub(crate) fn new(id: Oid) -> Self {
        Self {
            id,
            state: Mutex::new(OwnerState {
                tasks: BTreeMap::new(),
                nlive: 0,
                nzombies: 0,
                nrunning: 0,
                nwaiters: 0,
                pending_detached: None,
                waiting_on: BTreeMap::new(),
                torn_down: false,
            }),
            change: CondVar::new(),
            ctl: CtlPool::new(),
        }
    }

    /// Owner id
    #[inline]
    pub fn id(&self) -> Oid {
        self.id
    }

    /// The owner's control-block pool
    #[inline]
    pub fn ctl_pool(&self) -> &CtlPool {
        &self.ctl
    }

    /// Counter snapshot under the owner mutex
    pub fn counts(&self) -> OwnerCounts {
        let st = self.state.lock();
        OwnerCounts {
            total: st.tasks.len() as u32,
            live: st.nlive,
            zombies: st.nzombies,
            running: st.nrunning,
            waiters: st.nwaiters,
        }
    }

    /// Look up a task in this owner's set
    pub fn find_task(&self, tid: Tid) -> Option<Arc<Task>> {
        self.state.lock().tasks.get(&tid).cloned()
    }

    /// Broadcast the change condvar
    pub(crate) fn notify(&self) {
        self.change.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_owner_is_empty() {
        let o = Owner::new(1);
        let c = o.counts();
        assert_eq!(c.total, 0);
        assert_eq!(c.live, 0);
        assert_eq!(c.zombies, 0);
        assert!(o.find_task(1).is_none());
    }
}
