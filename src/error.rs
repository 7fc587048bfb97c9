//! Unified error type for the lifecycle core
//!
//! `Error` uses `#[repr(i32)]` with discriminants equal to errno values.
//! This eliminates all error translation - the discriminant IS the errno.

/// Lifecycle error type with errno values as discriminants
///
/// Each variant's value is its errno. This allows zero-cost conversion
/// to syscall return values via simple negation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    /// No such process (ESRCH) - the operation named a task id that is
    /// Idle, Zombie or absent in a context requiring a live one
    NoProcess = 3,
    /// Interrupted system call (EINTR) - a blocking wait was interrupted
    /// by a pending signal on the caller; the caller must retry
    Interrupted = 4,
    /// No child processes (ECHILD) - a wait found no task that could
    /// ever match
    NoChild = 10,
    /// Resource temporarily unavailable (EAGAIN) - a non-blocking probe
    /// found nothing ready
    WouldBlock = 11,
    /// Out of memory (ENOMEM) - TCB or control-block page allocation
    /// failed; fatal to the caller's request only, never to the owner
    OutOfMemory = 12,
    /// Invalid argument (EINVAL)
    InvalidArgument = 22,
    /// Resource deadlock avoided (EDEADLK) - the operation would block
    /// every task, including natural self-targeting
    Deadlock = 35,
}

impl Error {
    /// Return negative errno for syscall return (i64)
    ///
    /// Example: `Error::NoProcess.sysret()` returns -3
    #[inline]
    pub const fn sysret(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Get the positive errno value
    #[inline]
    pub const fn errno(self) -> i32 {
        self as i32
    }
}

/// Result type alias for lifecycle operations
pub type Result<T> = core::result::Result<T, Error>;
