//! # Synchronization Primitives
//!
//! Locking and ordering primitives shared by every subsystem:
//!
//! - `TicketLock`: FIFO-fair spinlock, the default for all scheduler and
//!   allocator state
//! - `IrqTicketLock`: ticket lock that saves and disables interrupts for
//!   the critical section; required for any lock also taken from
//!   interrupt context (run-queue locks, NUMA node locks)
//! - `RwLock`: reader/writer lock with writer serialization
//! - `SeqLock`: sequence lock for read-mostly published data
//! - memory fences

pub mod fences;
pub mod rwlock;
pub mod seqlock;
pub mod ticket;

pub use fences::{memory_barrier, read_barrier, write_barrier};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use seqlock::SeqLock;
pub use ticket::{IrqTicketLock, IrqTicketLockGuard, TicketLock, TicketLockGuard};
