//! Lightweight-process (LWP) lifecycle core
//!
//! This crate implements the thread lifecycle half of a kernel's process
//! subsystem: the task state machine, the dynamic lock-ownership protocol,
//! create/exit/suspend/resume/wait semantics, explicit reference counting
//! with a blocking drain, and a per-owner shared control-block allocator
//! for lock-free status polling from user space.
//!
//! CPU dispatch itself is an external collaborator: the core calls into a
//! [`sched::Scheduler`] to enqueue and dequeue tasks but implements no
//! run-queue policy of its own (a reference implementation is provided for
//! tests and simple embedders).
//!
//! ## Locking discipline
//!
//! Each task carries a handle to whichever lock currently protects it;
//! the lock changes identity as the task migrates between scheduling
//! domains (run queue, processor, sleep queue). See [`lock`] for the
//! acquire-then-reverify protocol and [`manager`] for the lock order.
//!
//! The crate is `no_std` + `alloc`; tests run hosted.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod condvar;
pub mod ctlblock;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod manager;
pub mod owner;
pub mod sched;
pub mod sleepq;
pub mod task;

pub use error::{Error, Result};
pub use manager::{CreateFlags, TaskManager, UserReturn, WaitFlags};
pub use task::{Oid, Priority, Task, TaskFlags, TaskState, Tid};
