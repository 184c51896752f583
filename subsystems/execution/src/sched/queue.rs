//! # Per-CPU Run Queue
//!
//! One FIFO per (class, level) pair plus two bitmaps for O(1) selection:
//! bit *l* of `active_bitmap[c]` is set exactly when `queues[c][l]` is
//! non-empty, and bit *c* of `class_bitmap` is set exactly when any
//! level of class *c* is active. Selection scans classes high → low,
//! then takes the highest set level bit, then the FIFO head.
//!
//! The whole structure lives behind one IRQ-saving ticket lock per CPU;
//! the tick handler and the reschedule-IPI handler both take it from
//! interrupt context.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use orion_hal::sync::IrqTicketLock;

use crate::thread::{SchedClass, Thread, ThreadState, NUM_CLASSES, PRIO_LEVELS};

/// FIFO of threads at one (class, level) pair.
#[derive(Debug, Default)]
pub struct PrioQueue {
    list: VecDeque<Arc<Thread>>,
    count: u32,
}

impl PrioQueue {
    const fn new() -> Self {
        Self {
            list: VecDeque::new(),
            count: 0,
        }
    }

    /// Number of queued threads.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Run-queue state guarded by the per-CPU lock.
pub struct RunQueueInner {
    cpu_id: u32,
    queues: [[PrioQueue; PRIO_LEVELS as usize]; NUM_CLASSES as usize],
    active_bitmap: [u32; NUM_CLASSES as usize],
    class_bitmap: u32,
    nr_running: u32,

    /// Currently running thread.
    pub current: Option<Arc<Thread>>,
    /// This CPU's idle thread; never enqueued.
    pub idle: Option<Arc<Thread>>,

    /// Run-queue clock, advanced by the tick handler (ns).
    pub clock_ns: u64,
    /// Ticks observed on this CPU.
    pub tick_count: u64,
    /// Context switches performed.
    pub nr_switches: u64,
    /// Clock value of the last balance pass.
    pub last_balance: u64,
}

/// One CPU's run queue.
#[repr(align(64))]
pub struct RunQueue {
    inner: IrqTicketLock<RunQueueInner>,
}

impl RunQueue {
    /// Create an empty run queue for `cpu_id`.
    pub fn new(cpu_id: u32) -> Self {
        Self {
            inner: IrqTicketLock::new(RunQueueInner {
                cpu_id,
                queues: core::array::from_fn(|_| core::array::from_fn(|_| PrioQueue::new())),
                active_bitmap: [0; NUM_CLASSES as usize],
                class_bitmap: 0,
                nr_running: 0,
                current: None,
                idle: None,
                clock_ns: 0,
                tick_count: 0,
                nr_switches: 0,
                last_balance: 0,
            }),
        }
    }

    /// Acquire the queue lock (IRQ-saving).
    #[inline]
    pub fn lock(&self) -> orion_hal::sync::IrqTicketLockGuard<'_, RunQueueInner> {
        self.inner.lock()
    }
}

impl RunQueueInner {
    /// Owning CPU.
    #[inline]
    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    /// Count of runnable (queued) threads; the running thread is not
    /// included.
    #[inline]
    pub fn nr_running(&self) -> u32 {
        self.nr_running
    }

    /// Append a thread to the tail of its (class, level) FIFO and mark
    /// it Ready on this CPU.
    pub fn enqueue(&mut self, thread: Arc<Thread>) {
        let class = thread.class() as usize;
        let level = thread.queue_level() as usize;

        thread.set_state(ThreadState::Ready);
        thread.set_last_cpu(self.cpu_id);

        let queue = &mut self.queues[class][level];
        queue.list.push_back(thread);
        queue.count += 1;
        self.nr_running += 1;
        self.active_bitmap[class] |= 1 << level;
        self.class_bitmap |= 1 << class;
    }

    /// Remove a specific thread from its FIFO; true when it was queued
    /// here.
    pub fn dequeue_thread(&mut self, thread: &Arc<Thread>) -> bool {
        let class = thread.class() as usize;
        let level = thread.queue_level() as usize;

        if self.remove_at(class, level, thread) {
            return true;
        }
        // Priority may have changed since enqueue; sweep the class
        // levels before giving up.
        for class in 0..NUM_CLASSES as usize {
            for level in 0..PRIO_LEVELS as usize {
                if self.remove_at(class, level, thread) {
                    return true;
                }
            }
        }
        false
    }

    fn remove_at(&mut self, class: usize, level: usize, thread: &Arc<Thread>) -> bool {
        let queue = &mut self.queues[class][level];
        let Some(pos) = queue.list.iter().position(|t| Arc::ptr_eq(t, thread)) else {
            return false;
        };
        queue.list.remove(pos);
        queue.count -= 1;
        self.nr_running -= 1;
        if queue.count == 0 {
            self.active_bitmap[class] &= !(1 << level);
            if self.active_bitmap[class] == 0 {
                self.class_bitmap &= !(1 << class);
            }
        }
        true
    }

    /// Highest-priority (class, level) with a queued thread.
    fn highest_active(&self) -> Option<(usize, usize)> {
        if self.class_bitmap == 0 {
            return None;
        }
        let class = 31 - self.class_bitmap.leading_zeros();
        let levels = self.active_bitmap[class as usize];
        debug_assert_ne!(levels, 0);
        let level = 31 - levels.leading_zeros();
        Some((class as usize, level as usize))
    }

    /// Dequeue the next thread to run: highest class, highest level,
    /// FIFO head. `None` when nothing is queued (the caller substitutes
    /// the idle thread).
    pub fn take_next(&mut self) -> Option<Arc<Thread>> {
        let (class, level) = self.highest_active()?;
        let queue = &mut self.queues[class][level];
        let thread = queue.list.pop_front()?;
        queue.count -= 1;
        self.nr_running -= 1;
        if queue.count == 0 {
            self.active_bitmap[class] &= !(1 << level);
            if self.active_bitmap[class] == 0 {
                self.class_bitmap &= !(1 << class);
            }
        }
        Some(thread)
    }

    /// Peek the next thread without dequeuing.
    pub fn peek_next(&self) -> Option<&Arc<Thread>> {
        let (class, level) = self.highest_active()?;
        self.queues[class][level].list.front()
    }

    /// Walk queued threads from the lowest priority upward (the cheap
    /// migration candidates first); the callback returns true to stop.
    pub fn for_each_lowest_first<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Thread>) -> bool,
    {
        for class in 0..NUM_CLASSES as usize {
            for level in 0..PRIO_LEVELS as usize {
                for thread in &self.queues[class][level].list {
                    if f(thread) {
                        return;
                    }
                }
            }
        }
    }

    /// Queue length at one (class, level).
    pub fn queue_count(&self, class: SchedClass, level: u8) -> u32 {
        self.queues[class as usize][level as usize].count()
    }

    /// Verify the structural invariants: counts sum to `nr_running`
    /// and both bitmaps reflect emptiness exactly.
    pub fn check_invariants(&self) -> bool {
        let mut total = 0u32;
        for class in 0..NUM_CLASSES as usize {
            let mut class_active = 0u32;
            for level in 0..PRIO_LEVELS as usize {
                let queue = &self.queues[class][level];
                if queue.count as usize != queue.list.len() {
                    return false;
                }
                total += queue.count;
                let bit_set = self.active_bitmap[class] & (1 << level) != 0;
                if bit_set != (queue.count > 0) {
                    return false;
                }
                if queue.count > 0 {
                    class_active |= 1 << level;
                }
            }
            if (self.class_bitmap & (1 << class) != 0) != (class_active != 0) {
                return false;
            }
        }
        total == self.nr_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{ProcessId, ThreadFlags, ThreadId};

    fn thread(id: u32, class: SchedClass, level: u8) -> Arc<Thread> {
        let t = Thread::new(
            ThreadId(id),
            ProcessId(1),
            "rq-test",
            ThreadFlags::empty(),
            None,
            0,
        );
        t.set_priority(class, level);
        Arc::new(t)
    }

    #[test]
    fn test_empty_queue() {
        let rq = RunQueue::new(0);
        let mut inner = rq.lock();
        assert_eq!(inner.nr_running(), 0);
        assert!(inner.take_next().is_none());
        assert!(inner.check_invariants());
    }

    #[test]
    fn test_enqueue_sets_ready_and_cpu() {
        let rq = RunQueue::new(3);
        let t = thread(1, SchedClass::Regular, 16);
        let mut inner = rq.lock();
        inner.enqueue(Arc::clone(&t));
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.last_cpu(), 3);
        assert_eq!(inner.nr_running(), 1);
        assert!(inner.check_invariants());
    }

    #[test]
    fn test_fifo_within_level() {
        let rq = RunQueue::new(0);
        let a = thread(1, SchedClass::Regular, 16);
        let b = thread(2, SchedClass::Regular, 16);
        let c = thread(3, SchedClass::Regular, 16);

        let mut inner = rq.lock();
        inner.enqueue(Arc::clone(&a));
        inner.enqueue(Arc::clone(&b));
        inner.enqueue(Arc::clone(&c));

        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &a));
        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &b));
        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &c));
        assert!(inner.check_invariants());
    }

    #[test]
    fn test_higher_class_wins() {
        let rq = RunQueue::new(0);
        let regular = thread(1, SchedClass::Regular, 31);
        let critical = thread(2, SchedClass::TimeCritical, 0);
        let server = thread(3, SchedClass::Server, 0);

        let mut inner = rq.lock();
        inner.enqueue(Arc::clone(&regular));
        inner.enqueue(Arc::clone(&critical));
        inner.enqueue(Arc::clone(&server));

        // Server > TimeCritical > Regular regardless of level.
        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &server));
        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &critical));
        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &regular));
    }

    #[test]
    fn test_higher_level_wins_within_class() {
        let rq = RunQueue::new(0);
        let low = thread(1, SchedClass::Regular, 4);
        let high = thread(2, SchedClass::Regular, 29);

        let mut inner = rq.lock();
        inner.enqueue(Arc::clone(&low));
        inner.enqueue(Arc::clone(&high));

        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &high));
        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &low));
    }

    #[test]
    fn test_dequeue_specific_clears_bits() {
        let rq = RunQueue::new(0);
        let a = thread(1, SchedClass::Server, 10);
        let b = thread(2, SchedClass::Regular, 16);

        let mut inner = rq.lock();
        inner.enqueue(Arc::clone(&a));
        inner.enqueue(Arc::clone(&b));
        assert!(inner.dequeue_thread(&a));
        assert!(!inner.dequeue_thread(&a));
        assert_eq!(inner.nr_running(), 1);
        assert!(inner.check_invariants());

        // Only the Regular thread is left.
        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &b));
    }

    #[test]
    fn test_dequeue_after_priority_change() {
        // The thread moved levels after being queued; dequeue must
        // still find it.
        let rq = RunQueue::new(0);
        let t = thread(1, SchedClass::Regular, 16);
        let mut inner = rq.lock();
        inner.enqueue(Arc::clone(&t));
        t.set_priority(SchedClass::Server, 2);
        assert!(inner.dequeue_thread(&t));
        assert_eq!(inner.nr_running(), 0);
        assert!(inner.check_invariants());
    }

    #[test]
    fn test_counts_per_level() {
        let rq = RunQueue::new(0);
        let mut inner = rq.lock();
        for id in 0..5 {
            inner.enqueue(thread(id, SchedClass::Regular, 16));
        }
        inner.enqueue(thread(9, SchedClass::Regular, 3));
        assert_eq!(inner.queue_count(SchedClass::Regular, 16), 5);
        assert_eq!(inner.queue_count(SchedClass::Regular, 3), 1);
        assert_eq!(inner.nr_running(), 6);
        assert!(inner.check_invariants());
    }
}
