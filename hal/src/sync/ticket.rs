//! # Ticket Spinlock
//!
//! FIFO-fair spinlock. The lock word is 32 bits split into two 16-bit
//! counters: `head` is the ticket currently being served, `tail` the next
//! ticket to hand out. Acquisition draws a ticket from `tail` and spins
//! (with a CPU pause hint) until `head` reaches it; release advances
//! `head`. Under contention every waiter is served in arrival order and
//! the worst-case wait is bounded by the number of earlier tickets.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::arch::{self, IrqFlags};

// =============================================================================
// Raw Lock Word
// =============================================================================

/// The two 16-bit halves of the ticket word.
///
/// `AtomicU16` fields keep the increments confined to their half; a
/// release of ticket 0xFFFF must wrap within `head` rather than carry
/// into `tail`.
#[repr(C)]
struct RawTicket {
    /// Next ticket to be served.
    head: AtomicU16,
    /// Next ticket to be handed out.
    tail: AtomicU16,
}

static_assertions::assert_eq_size!(RawTicket, u32);

impl RawTicket {
    const fn new() -> Self {
        Self {
            head: AtomicU16::new(0),
            tail: AtomicU16::new(0),
        }
    }

    /// Draw a ticket and spin until it is served.
    fn acquire(&self) {
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        while self.head.load(Ordering::Acquire) != ticket {
            arch::pause();
        }
    }

    /// Attempt to take the lock without spinning.
    fn try_acquire(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        // Lock is free iff tail == head; claim by advancing tail from
        // exactly that value.
        self.tail
            .compare_exchange(head, head.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Serve the next ticket.
    fn release(&self) {
        self.head.fetch_add(1, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.head.load(Ordering::Relaxed) != self.tail.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Ticket Lock
// =============================================================================

/// FIFO-fair spinlock protecting `T`.
pub struct TicketLock<T: ?Sized> {
    raw: RawTicket,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for TicketLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for TicketLock<T> {}

impl<T: ?Sized + core::fmt::Debug> core::fmt::Debug for TicketLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("TicketLock").field("data", &&*guard).finish(),
            None => f
                .debug_struct("TicketLock")
                .field("data", &"<locked>")
                .finish(),
        }
    }
}

impl<T> TicketLock<T> {
    /// Create a new unlocked ticket lock.
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawTicket::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> TicketLock<T> {
    /// Acquire the lock, spinning until it is granted.
    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        self.raw.acquire();
        TicketLockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(TicketLockGuard {
                lock: self,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Check whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Get mutable access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for [`TicketLock`].
pub struct TicketLockGuard<'a, T: ?Sized> {
    lock: &'a TicketLock<T>,
    _marker: PhantomData<*mut ()>,
}

impl<T: ?Sized> core::ops::Deref for TicketLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> core::ops::DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

// =============================================================================
// IRQ-Saving Ticket Lock
// =============================================================================

/// Ticket lock whose critical section runs with interrupts disabled.
///
/// Required for any lock also taken from interrupt context: the tick
/// handler and the reschedule-IPI handler take run-queue locks, and the
/// NUMA node locks appear in paths that already disabled interrupts.
/// The previous interrupt-enable state is captured on acquire and
/// restored on release.
pub struct IrqTicketLock<T: ?Sized> {
    raw: RawTicket,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for IrqTicketLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for IrqTicketLock<T> {}

impl<T> IrqTicketLock<T> {
    /// Create a new unlocked lock.
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawTicket::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> IrqTicketLock<T> {
    /// Disable interrupts and acquire the lock.
    pub fn lock(&self) -> IrqTicketLockGuard<'_, T> {
        let flags = arch::irq_save();
        self.raw.acquire();
        IrqTicketLockGuard {
            lock: self,
            flags,
            _marker: PhantomData,
        }
    }

    /// Check whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Get mutable access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for [`IrqTicketLock`]; restores the saved interrupt flag
/// after releasing the lock.
pub struct IrqTicketLockGuard<'a, T: ?Sized> {
    lock: &'a IrqTicketLock<T>,
    flags: IrqFlags,
    _marker: PhantomData<*mut ()>,
}

impl<T: ?Sized> core::ops::Deref for IrqTicketLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> core::ops::DerefMut for IrqTicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqTicketLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
        arch::irq_restore(self.flags);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn test_lock_unlock() {
        let lock = TicketLock::new(5u32);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_try_lock() {
        let lock = TicketLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(TicketLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn test_fifo_fairness() {
        // Each contender records how many times it acquired while others
        // were waiting; with ticket ordering no acquirer can be passed,
        // so every contender completes its fixed quota.
        const CONTENDERS: usize = 4;
        const ROUNDS: usize = 200;

        let lock = Arc::new(TicketLock::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for id in 0..CONTENDERS {
            let lock = Arc::clone(&lock);
            let done = Arc::clone(&done);
            handles.push(thread::spawn(move || {
                for _ in 0..ROUNDS {
                    lock.lock().push(id);
                }
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(done.load(Ordering::SeqCst), CONTENDERS);
        let order = lock.lock();
        assert_eq!(order.len(), CONTENDERS * ROUNDS);
        // Bounded wait: in any window of CONTENDERS * ROUNDS entries each
        // id appears exactly ROUNDS times.
        for id in 0..CONTENDERS {
            assert_eq!(order.iter().filter(|&&x| x == id).count(), ROUNDS);
        }
    }

    #[test]
    fn test_ticket_wraparound() {
        // Drive the 16-bit counters across the wrap boundary.
        let lock = TicketLock::new(0u32);
        for _ in 0..70_000u32 {
            *lock.lock() += 1;
        }
        assert_eq!(*lock.lock(), 70_000);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_irq_lock_smoke() {
        let lock = IrqTicketLock::new(1u32);
        {
            let mut g = lock.lock();
            *g = 2;
        }
        assert_eq!(*lock.lock(), 2);
        assert!(!lock.is_locked());
    }
}
