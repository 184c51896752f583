//! # Reader/Writer Lock
//!
//! Signed-count reader/writer lock: 0 means free, a positive value is
//! the number of active readers, -1 is an exclusive writer. A companion
//! ticket lock serializes writers, which also keeps a stream of readers
//! from starving a waiting writer (the writer holds the serialization
//! lock while it waits for the count to drain to zero).

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicI32, Ordering};

use super::ticket::{TicketLock, TicketLockGuard};
use crate::arch;

/// Reader/writer spinlock protecting `T`.
pub struct RwLock<T: ?Sized> {
    /// 0 = free, >0 = reader count, -1 = writer.
    count: AtomicI32,
    /// Serializes writers.
    writer: TicketLock<()>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Create a new unlocked lock.
    pub const fn new(data: T) -> Self {
        Self {
            count: AtomicI32::new(0),
            writer: TicketLock::new(()),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquire a shared read lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let count = self.count.load(Ordering::Relaxed);
            if count >= 0
                && self
                    .count
                    .compare_exchange_weak(count, count + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            arch::pause();
        }
        RwLockReadGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Acquire the exclusive write lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let serial = self.writer.lock();
        // Wait for readers to drain, then claim exclusivity.
        while self
            .count
            .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            arch::pause();
        }
        RwLockWriteGuard {
            lock: self,
            _serial: serial,
        }
    }

    /// Try to acquire a read lock without spinning.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let count = self.count.load(Ordering::Relaxed);
        if count >= 0
            && self
                .count
                .compare_exchange(count, count + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            Some(RwLockReadGuard {
                lock: self,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Try to acquire the write lock without spinning.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let serial = self.writer.try_lock()?;
        if self
            .count
            .compare_exchange(0, -1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(RwLockWriteGuard {
                lock: self,
                _serial: serial,
            })
        } else {
            None
        }
    }
}

/// Shared read guard.
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _marker: PhantomData<*const ()>,
}

impl<T: ?Sized> core::ops::Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.count.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive write guard.
///
/// Holds the writer-serialization guard for its whole lifetime; dropping
/// publishes the data (count back to 0) before the next writer is served.
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _serial: TicketLockGuard<'a, ()>,
}

impl<T: ?Sized> core::ops::Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> core::ops::DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.count.store(0, Ordering::Release);
    }
}
