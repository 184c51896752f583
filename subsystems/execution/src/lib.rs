//! # Orion Execution Subsystem
//!
//! The SMP thread scheduler: thread records, per-CPU priority-
//! structured run queues with O(1) selection, time-slicing and
//! preemption, blocking and waking through wait channels, CPU affinity,
//! periodic and idle load balancing, and the external thread-lifecycle
//! API.
//!
//! Each online CPU schedules independently on its own run queue; remote
//! state is reached only under the owning queue's IRQ-saving lock, and
//! cross-CPU preemption travels as a reschedule IPI.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod api;
pub mod registry;
pub mod sched;
pub mod thread;
pub mod wait;

pub use api::Status;
pub use sched::balance;
pub use thread::{ProcessId, SchedClass, Thread, ThreadId, ThreadState};

use core::fmt;

/// Scheduler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// CPU id out of range.
    InvalidCpu,
    /// Run queue already initialized for this CPU.
    AlreadyInitialized,
    /// Run-queue allocation failed.
    OutOfMemory,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::InvalidCpu => write!(f, "invalid CPU id"),
            SchedError::AlreadyInitialized => write!(f, "run queue already initialized"),
            SchedError::OutOfMemory => write!(f, "run queue allocation failed"),
        }
    }
}

/// Serializes unit tests that drive the process-global scheduler state.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
