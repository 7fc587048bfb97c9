//! External collaborator seams
//!
//! The lifecycle core consumes a credentials service, a signal service
//! and an owner-teardown routine. Each is a trait with a no-op default so
//! the core runs standalone; a kernel embedding it supplies real
//! implementations.

use crate::task::{Oid, Task, Tid};

/// Task credentials
///
/// Copied from the template at create time and released at exit. The
/// core never interprets them beyond the root check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    /// Real user ID
    pub uid: u32,
    /// Real group ID
    pub gid: u32,
    /// Effective user ID
    pub euid: u32,
    /// Effective group ID
    pub egid: u32,
}

impl Cred {
    /// Root credentials (all fields 0)
    pub const ROOT: Self = Self {
        uid: 0,
        gid: 0,
        euid: 0,
        egid: 0,
    };

    /// Create credentials for a specific user/group
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            euid: uid,
            egid: gid,
        }
    }

    /// Check if running as root
    pub fn is_root(&self) -> bool {
        self.euid == 0
    }
}

impl Default for Cred {
    fn default() -> Self {
        Self::ROOT
    }
}

/// Credentials service: copy at create, release at exit
///
/// A real kernel refcounts credential records; the default treats them
/// as plain values.
pub trait CredHooks: Send + Sync {
    /// Duplicate credentials for a newly created task
    fn copy(&self, template: &Cred) -> Cred {
        *template
    }

    /// Release a task's cached credentials at exit
    fn release(&self, _cred: Cred) {}
}

/// What the signal service did with a pending signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Delivered; continue to user level
    Delivered,
    /// Job-control stop requested; the task must enter Stopped
    Stop,
    /// Fatal; the task must exit with the given code
    Kill(i32),
}

/// Signal service: pending-signal delivery and exit propagation
///
/// Delivery policy is out of scope here; only the hook points are
/// modeled. `deliver_pending` is invoked from the user-return check with
/// the pending bit already cleared.
pub trait SignalHooks: Send + Sync {
    /// Deliver whatever is pending for `task`
    fn deliver_pending(&self, _task: &Task) -> SignalAction {
        SignalAction::Delivered
    }

    /// Propagate an exiting task's pending signals to its siblings
    fn propagate_exit(&self, _owner: Oid, _exiting: Tid) {}
}

/// Exit-path hooks
pub trait ExitHooks: Send + Sync {
    /// Per-owner emulation exit hook, run early in `exit`
    fn emul_exit(&self, _task: &Task) {}

    /// Invoked by the exit that drops the owner's live count to zero,
    /// just before the owner is torn down
    fn owner_teardown(&self, _owner: Oid) {}
}

/// No-op implementation of every collaborator
pub struct DefaultHooks;

impl CredHooks for DefaultHooks {}
impl SignalHooks for DefaultHooks {}
impl ExitHooks for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cred_defaults() {
        assert!(Cred::ROOT.is_root());
        let c = Cred::new(1000, 100);
        assert!(!c.is_root());
        assert_eq!(c.euid, 1000);
        assert_eq!(DefaultHooks.copy(&c), c);
    }
}
