//! Scheduler collaborator seam and a reference run queue
//!
//! The lifecycle core delegates all dispatch policy to an external
//! scheduler: it tells the scheduler when a task becomes eligible or
//! stops being eligible, and nothing more. `SimpleScheduler` is a
//! small level-ordered FIFO queue provided for tests and simple
//! embedders.

use alloc::collections::{BTreeMap, VecDeque};

use spin::Mutex;

use crate::task::{Priority, Tid};

/// The synchronous surface the lifecycle core calls into
///
/// All calls are bounded and non-blocking; the scheduler must tolerate
/// them under the run-queue lock.
pub trait Scheduler: Send + Sync {
    /// `tid` became eligible to run at `priority`
    fn enqueue(&self, tid: Tid, priority: Priority);

    /// `tid` is no longer eligible (slept, stopped, exited)
    ///
    /// May be called for a task the scheduler has already handed out;
    /// implementations ignore unknown tids.
    fn dequeue(&self, tid: Tid, priority: Priority);

    /// Remove and return the most eligible task, if any
    fn pick_next(&self) -> Option<Tid>;
}

/// Reference scheduler: FIFO per priority level, highest level first
///
/// Levels are kept in an ordered map and dropped as they empty, so the
/// structure stays as small as the set of priorities actually in use.
pub struct SimpleScheduler {
    levels: Mutex<BTreeMap<Priority, VecDeque<Tid>>>,
}

impl SimpleScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            levels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of currently eligible tasks
    pub fn runnable_count(&self) -> usize {
        self.levels.lock().values().map(VecDeque::len).sum()
    }
}

impl Default for SimpleScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for SimpleScheduler {
    fn enqueue(&self, tid: Tid, priority: Priority) {
        self.levels
            .lock()
            .entry(priority)
            .or_default()
            .push_back(tid);
    }

    fn dequeue(&self, tid: Tid, priority: Priority) {
        let mut levels = self.levels.lock();
        if let Some(queue) = levels.get_mut(&priority) {
            queue.retain(|&t| t != tid);
            if queue.is_empty() {
                levels.remove(&priority);
            }
        }
    }

    fn pick_next(&self) -> Option<Tid> {
        let mut levels = self.levels.lock();
        let (&priority, queue) = levels.iter_mut().next_back()?;
        let tid = queue.pop_front()?;
        if queue.is_empty() {
            levels.remove(&priority);
        }
        Some(tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_wins() {
        let s = SimpleScheduler::new();
        s.enqueue(1, 10);
        s.enqueue(2, 200);
        s.enqueue(3, 128);
        assert_eq!(s.pick_next(), Some(2));
        assert_eq!(s.pick_next(), Some(3));
        assert_eq!(s.pick_next(), Some(1));
        assert_eq!(s.pick_next(), None);
    }

    #[test]
    fn fifo_within_level() {
        let s = SimpleScheduler::new();
        s.enqueue(1, 50);
        s.enqueue(2, 50);
        assert_eq!(s.pick_next(), Some(1));
        assert_eq!(s.pick_next(), Some(2));
    }

    #[test]
    fn dequeue_ignores_unknown_tasks() {
        let s = SimpleScheduler::new();
        s.enqueue(9, 77);
        s.dequeue(9, 77);
        s.dequeue(9, 77);
        assert_eq!(s.runnable_count(), 0);
        assert_eq!(s.pick_next(), None);
    }

    #[test]
    fn empty_levels_are_dropped() {
        let s = SimpleScheduler::new();
        s.enqueue(4, 128);
        s.enqueue(5, 129);
        assert_eq!(s.runnable_count(), 2);
        s.dequeue(5, 129);
        assert_eq!(s.pick_next(), Some(4));
        assert_eq!(s.pick_next(), None);
        assert!(s.levels.lock().is_empty());
    }
}
