//! # Scheduler Core
//!
//! Per-CPU scheduling with no global loop: each CPU runs `schedule()`
//! at its own reschedule points (tick-driven preemption, voluntary
//! yield, blocking, `preempt_enable` reaching zero with the reschedule
//! flag raised).
//!
//! Locking: a run queue's IRQ-saving lock is held only for queue
//! manipulation, never across the context switch, an allocation, or a
//! delivery-waiting IPI. The global scheduler lock (affinity changes,
//! cross-CPU coordination) ranks above every run-queue lock.

pub mod balance;
pub mod queue;

pub use queue::{RunQueue, RunQueueInner};

use alloc::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use orion_hal::arch::x86_64::apic::{self, ipi};
use orion_hal::arch::x86_64::context;
use orion_hal::arch::x86_64::smp::{self, cpu_info, per_cpu};
use orion_hal::sync::{self, TicketLock};
use orion_hal::MAX_CPUS;

use crate::registry;
use crate::thread::{
    ProcessId, SchedClass, Thread, ThreadFlags, ThreadState,
};
use crate::wait;
use crate::SchedError;

// =============================================================================
// Constants
// =============================================================================

/// Nanoseconds per scheduler tick (the APIC timer runs at 1 kHz).
pub const TICK_NS: u64 = 1_000_000;

/// Ticks between periodic balance requests.
pub const LOAD_BALANCE_INTERVAL: u64 = 100;

/// A thread that ran within this window is considered cache-hot and is
/// skipped by the balancer.
pub const CACHE_HOT_NS: u64 = 1_000_000;

// =============================================================================
// Global State
// =============================================================================

struct SchedulerState {
    /// Per-CPU run queues, published once at CPU init.
    runqueues: [AtomicPtr<RunQueue>; MAX_CPUS],
    /// Serializes affinity changes and cross-CPU coordination. Ranks
    /// above run-queue locks.
    global_lock: TicketLock<()>,
    /// Raised by the tick cadence, consumed by the balance paths.
    need_balance: AtomicBool,
}

static SCHEDULER: SchedulerState = SchedulerState {
    runqueues: [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS],
    global_lock: TicketLock::new(()),
    need_balance: AtomicBool::new(false),
};

/// Run queue of a CPU; `None` before that CPU was initialized.
pub fn runqueue(cpu_id: usize) -> Option<&'static RunQueue> {
    if cpu_id >= MAX_CPUS {
        return None;
    }
    let ptr = SCHEDULER.runqueues[cpu_id].load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Take the global scheduler lock.
pub(crate) fn global_lock() -> orion_hal::sync::TicketLockGuard<'static, ()> {
    SCHEDULER.global_lock.lock()
}

/// Whether the periodic balance flag is raised; clears it.
pub fn take_need_balance() -> bool {
    SCHEDULER.need_balance.swap(false, Ordering::AcqRel)
}

// =============================================================================
// CPU Initialization
// =============================================================================

/// Initialize scheduling for one CPU: place its run queue on the given
/// NUMA node and install the idle thread.
pub fn init_cpu(cpu_id: usize, node: u32) -> Result<(), SchedError> {
    if cpu_id >= MAX_CPUS {
        return Err(SchedError::InvalidCpu);
    }
    if !SCHEDULER.runqueues[cpu_id]
        .load(Ordering::Acquire)
        .is_null()
    {
        return Err(SchedError::AlreadyInitialized);
    }

    let rq = alloc_runqueue(cpu_id as u32, node)?;

    // The idle thread is bound to its CPU, lives in the Idle class, and
    // is never enqueued; it runs whenever nothing else is Ready.
    let idle = Arc::new(Thread::new(
        registry::allocate_tid(),
        ProcessId(0),
        "idle",
        ThreadFlags::KERNEL | ThreadFlags::IDLE | ThreadFlags::BOUND,
        None,
        cpu_id as u32,
    ));
    idle.set_priority(SchedClass::Idle, 0);
    idle.set_affinity(1u64 << cpu_id);
    idle.set_state(ThreadState::Running);
    registry::insert_thread(Arc::clone(&idle));

    {
        let mut inner = rq.lock();
        inner.idle = Some(Arc::clone(&idle));
        inner.current = Some(idle);
    }

    SCHEDULER.runqueues[cpu_id].store(rq as *const _ as *mut _, Ordering::Release);
    log::debug!("sched: CPU {} run queue on node {}", cpu_id, node);
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        fn alloc_runqueue(cpu_id: u32, node: u32) -> Result<&'static RunQueue, SchedError> {
            // Node-local placement through the NUMA allocator.
            let ptr = orion_memory::kmalloc_node(core::mem::size_of::<RunQueue>(), node)
                .map_err(|_| SchedError::OutOfMemory)?;
            let rq = ptr.as_ptr() as *mut RunQueue;
            unsafe {
                rq.write(RunQueue::new(cpu_id));
                Ok(&*rq)
            }
        }
    } else {
        fn alloc_runqueue(cpu_id: u32, _node: u32) -> Result<&'static RunQueue, SchedError> {
            Ok(alloc::boxed::Box::leak(alloc::boxed::Box::new(
                RunQueue::new(cpu_id),
            )))
        }
    }
}

// =============================================================================
// Current Thread & Preemption
// =============================================================================

/// The thread running on the calling CPU.
pub fn current_thread() -> Option<Arc<Thread>> {
    let rq = runqueue(per_cpu::current_cpu_id() as usize)?;
    rq.lock().current.clone()
}

/// Disable involuntary preemption on the calling CPU.
pub fn preempt_disable() {
    per_cpu::current_percpu().preempt_disable();
    sync::fences::compiler_barrier();
}

/// Re-enable preemption; runs the scheduler when the count reaches
/// zero with a reschedule pending.
pub fn preempt_enable() {
    sync::fences::compiler_barrier();
    let remaining = per_cpu::current_percpu().preempt_enable();
    if remaining == 0 {
        if let Some(current) = current_thread() {
            if current.needs_resched() {
                schedule();
            }
        }
    }
}

/// Preemption depth of the calling CPU.
pub fn preempt_count() -> u32 {
    per_cpu::current_percpu().preempt_count()
}

// =============================================================================
// Placement & Queue Operations
// =============================================================================

/// Choose the run-queue CPU for a thread: the preferred CPU when its
/// affinity and the online mask allow it, otherwise the first
/// affine-and-online CPU.
pub fn select_cpu(thread: &Thread) -> u32 {
    let affinity = thread.affinity();
    let online = smp::online_mask();
    let usable = affinity & online;

    let preferred = thread.preferred_cpu();
    if (preferred as usize) < MAX_CPUS && usable & (1 << preferred) != 0 {
        return preferred;
    }
    if usable != 0 {
        return usable.trailing_zeros();
    }
    // Nothing online intersects the mask; fall back to the boot CPU so
    // the thread stays schedulable.
    smp::bsp_cpu_id()
}

/// Enqueue a Ready thread, preempting the target's current thread when
/// the newcomer has strictly higher dynamic priority.
pub fn enqueue_thread(thread: Arc<Thread>) {
    let cpu = select_cpu(&thread) as usize;
    enqueue_on(cpu, thread);
}

/// Enqueue on an explicit CPU (balancer and tests).
pub(crate) fn enqueue_on(cpu: usize, thread: Arc<Thread>) {
    let Some(rq) = runqueue(cpu) else {
        log::warn!("sched: enqueue on uninitialized CPU {}", cpu);
        return;
    };

    let priority = thread.dynamic_priority();
    let mut preempt_target: Option<Arc<Thread>> = None;
    {
        let mut inner = rq.lock();
        inner.enqueue(thread);
        if let Some(current) = &inner.current {
            if !current.flags().contains(ThreadFlags::IDLE)
                && current.dynamic_priority() < priority
            {
                preempt_target = Some(Arc::clone(current));
            } else if current.flags().contains(ThreadFlags::IDLE) {
                preempt_target = Some(Arc::clone(current));
            }
        }
    }

    // The newcomer outranks (or displaces idle on) the target CPU; flag
    // the current thread and kick the CPU if it is remote. The lock is
    // already dropped: IPI sends may wait on prior delivery.
    if let Some(current) = preempt_target {
        current.set_flag(ThreadFlags::NEED_RESCHED);
        sync::write_barrier();
        let self_cpu = per_cpu::current_cpu_id() as usize;
        if cpu != self_cpu {
            if let Some(info) = cpu_info::get_cpu_info(cpu) {
                ipi::send_reschedule(info.apic_id());
            }
        }
    }
}

/// Remove a Ready thread from the queue currently holding it.
pub fn dequeue_thread(thread: &Arc<Thread>) -> bool {
    let Some(rq) = runqueue(thread.last_cpu() as usize) else {
        return false;
    };
    rq.lock().dequeue_thread(thread)
}

// =============================================================================
// schedule()
// =============================================================================

/// Pick and dispatch the next thread on the calling CPU.
///
/// No-op while the preemption count is positive, unless the current
/// thread has already left the Running state (blocking must always be
/// able to schedule away).
pub fn schedule() {
    let cpu = per_cpu::current_cpu_id() as usize;
    let Some(rq) = runqueue(cpu) else {
        return;
    };
    let percpu = per_cpu::current_percpu();

    let (prev, next) = {
        let mut inner = rq.lock();
        let now = inner.clock_ns;
        let prev = inner.current.clone();

        if let Some(prev) = &prev {
            if percpu.preempt_count() > 0 && prev.state() == ThreadState::Running {
                return;
            }

            prev.clear_flag(ThreadFlags::NEED_RESCHED);

            // Account the slice that just ran.
            let last = prev.last_run();
            if last != 0 && now > last {
                prev.account_runtime(now - last);
            }

            // A kill is retired here: the target observes the flag on
            // its next pass through the scheduler.
            if prev.flags().contains(ThreadFlags::TERMINATING)
                && prev.state() == ThreadState::Running
            {
                prev.set_state(ThreadState::Zombie);
            }

            // Still runnable: back to the tail of its level, which is
            // the round-robin rule at slice expiry.
            if prev.state() == ThreadState::Running
                && !prev.flags().contains(ThreadFlags::IDLE)
            {
                inner.enqueue(Arc::clone(prev));
            }
        }

        let next = match inner.take_next() {
            Some(next) => next,
            None => match &inner.idle {
                Some(idle) => Arc::clone(idle),
                // CPU not fully initialized; nothing to dispatch.
                None => return,
            },
        };

        next.set_state(ThreadState::Running);
        next.set_last_run(now);
        next.set_last_cpu(cpu as u32);
        next.refill_timeslice();

        let switched = match &prev {
            Some(prev) => !Arc::ptr_eq(prev, &next),
            None => true,
        };
        if switched {
            inner.nr_switches += 1;
            if let Some(prev) = &prev {
                prev.count_switch(prev.state() != ThreadState::Ready);
            }
        }
        inner.current = Some(Arc::clone(&next));
        (prev, next)
    };

    // Publish the new current before any reschedule IPI can observe it.
    percpu.set_current_thread(Arc::as_ptr(&next) as u64);
    sync::write_barrier();

    let switched = match &prev {
        Some(prev) => !Arc::ptr_eq(prev, &next),
        None => true,
    };
    if switched {
        if let Some(prev) = prev {
            // The switch itself runs outside the run-queue lock.
            unsafe {
                context::switch(prev.context_ptr(), next.context_ptr());
            }
        }
    }
}

/// Voluntarily give up the CPU; the thread re-queues at the tail of its
/// level.
pub fn yield_now() {
    if let Some(current) = current_thread() {
        current.set_timeslice(0);
        current.set_flag(ThreadFlags::NEED_RESCHED);
    }
    schedule();
}

/// Retire the calling thread. On bare metal this never returns; the
/// reaper collects the zombie record later.
pub fn exit_current() {
    if let Some(current) = current_thread() {
        current.set_flag(ThreadFlags::TERMINATING);
        wait::cancel_timed_wait(&current);
    }
    schedule();
}

// =============================================================================
// Tick Handling
// =============================================================================

/// Scheduler tick for the calling CPU.
pub fn tick() {
    tick_on(per_cpu::current_cpu_id() as usize);
}

/// Scheduler tick body, parameterized by CPU for the timer path and the
/// tests.
pub fn tick_on(cpu: usize) {
    let Some(rq) = runqueue(cpu) else {
        return;
    };

    let now;
    {
        let mut inner = rq.lock();
        inner.tick_count += 1;
        inner.clock_ns += TICK_NS;
        now = inner.clock_ns;

        if let Some(current) = inner.current.clone() {
            if !current.flags().contains(ThreadFlags::IDLE) {
                current.decay_boost();
                if current.tick_timeslice() {
                    current.set_flag(ThreadFlags::NEED_RESCHED);
                }
            }
        }

        if inner.tick_count % LOAD_BALANCE_INTERVAL == 0 {
            SCHEDULER.need_balance.store(true, Ordering::Release);
        }
    }

    // Sleep deadlines are swept outside the queue lock; expired
    // sleepers re-enqueue through the normal path.
    wait::sweep_sleepers(now);
}

/// Timer-interrupt body: account the tick, acknowledge the interrupt,
/// and reschedule if the tick demanded it.
pub fn timer_interrupt() {
    let percpu = per_cpu::current_percpu();
    percpu.enter_irq();
    tick();
    apic::eoi();
    percpu.exit_irq();

    if let Some(current) = current_thread() {
        if current.needs_resched() && percpu.preempt_count() == 0 {
            schedule();
        }
    }
}

/// Reschedule-IPI body: raise the flag on the running thread and
/// acknowledge. The return path re-evaluates it.
pub fn handle_reschedule_ipi() {
    ipi::note_received();
    if let Some(current) = current_thread() {
        current.set_flag(ThreadFlags::NEED_RESCHED);
    }
    apic::eoi();
}

// =============================================================================
// Statistics
// =============================================================================

/// Scheduler clock of the calling CPU in nanoseconds (tick-driven).
pub fn now_ns() -> u64 {
    runqueue(per_cpu::current_cpu_id() as usize)
        .map(|rq| rq.lock().clock_ns)
        .unwrap_or(0)
}

/// Per-CPU scheduling statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    /// Queued runnable threads.
    pub nr_running: u32,
    /// Context switches performed.
    pub nr_switches: u64,
    /// Ticks observed.
    pub tick_count: u64,
}

/// Statistics for one CPU.
pub fn stats(cpu: usize) -> Option<SchedStats> {
    let rq = runqueue(cpu)?;
    let inner = rq.lock();
    Some(SchedStats {
        nr_running: inner.nr_running(),
        nr_switches: inner.nr_switches,
        tick_count: inner.tick_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_guard;
    use crate::thread::ThreadId;

    fn make_thread(id: u32, class: SchedClass, level: u8) -> Arc<Thread> {
        let t = Arc::new(Thread::new(
            ThreadId(10_000 + id),
            ProcessId(1),
            "sched-test",
            ThreadFlags::empty(),
            None,
            0,
        ));
        t.set_priority(class, level);
        t
    }

    fn ensure_cpu(cpu: usize) {
        let _ = init_cpu(cpu, 0);
        orion_hal::arch::x86_64::smp::set_cpu_online(cpu, true);
    }

    fn drain_cpu(cpu: usize) {
        if let Some(rq) = runqueue(cpu) {
            let mut inner = rq.lock();
            while inner.take_next().is_some() {}
        }
    }

    #[test]
    fn test_init_cpu_installs_idle() {
        let _guard = test_guard();
        ensure_cpu(0);
        let rq = runqueue(0).unwrap();
        let inner = rq.lock();
        let idle = inner.idle.as_ref().unwrap();
        assert!(idle.flags().contains(ThreadFlags::IDLE));
        assert!(idle.flags().contains(ThreadFlags::BOUND));
        assert_eq!(idle.class(), SchedClass::Idle);
        assert_eq!(idle.affinity(), 1);
        assert_eq!(init_cpu(0, 0), Err(SchedError::AlreadyInitialized));
    }

    #[test]
    fn test_select_cpu_prefers_hint() {
        let _guard = test_guard();
        ensure_cpu(0);
        ensure_cpu(1);

        let t = make_thread(1, SchedClass::Regular, 16);
        t.set_preferred_cpu(1);
        assert_eq!(select_cpu(&t), 1);

        // Hint not in the affinity mask: first affine-and-online bit.
        t.set_affinity(1 << 0);
        assert_eq!(select_cpu(&t), 0);
    }

    #[test]
    fn test_enqueue_flags_preemption() {
        // A Regular thread is current; a TimeCritical enqueue must
        // raise NEED_RESCHED and win the next pick.
        let _guard = test_guard();
        ensure_cpu(2);
        drain_cpu(2);
        let rq = runqueue(2).unwrap();

        let regular = make_thread(2, SchedClass::Regular, 16);
        regular.set_state(ThreadState::Running);
        regular.set_timeslice(5);
        rq.lock().current = Some(Arc::clone(&regular));

        let critical = make_thread(3, SchedClass::TimeCritical, 16);
        enqueue_on(2, Arc::clone(&critical));

        assert!(regular.needs_resched());
        let mut inner = rq.lock();
        assert!(Arc::ptr_eq(&inner.take_next().unwrap(), &critical));
        // Restore idle as current for other tests.
        let idle = inner.idle.clone();
        inner.current = idle;
        regular.clear_flag(ThreadFlags::NEED_RESCHED);
    }

    #[test]
    fn test_enqueue_equal_priority_does_not_preempt() {
        let _guard = test_guard();
        ensure_cpu(3);
        drain_cpu(3);
        let rq = runqueue(3).unwrap();

        let a = make_thread(4, SchedClass::Regular, 16);
        a.set_state(ThreadState::Running);
        rq.lock().current = Some(Arc::clone(&a));

        let b = make_thread(5, SchedClass::Regular, 16);
        enqueue_on(3, b);

        assert!(!a.needs_resched());
        drain_cpu(3);
        let mut inner = rq.lock();
        let idle = inner.idle.clone();
        inner.current = idle;
    }

    #[test]
    fn test_remote_enqueue_sends_reschedule_ipi() {
        let _guard = test_guard();
        ensure_cpu(4);
        drain_cpu(4);
        orion_hal::arch::x86_64::smp::cpu_info::register_cpu(4, 1004, 4, 0, false).unwrap();
        let rq = runqueue(4).unwrap();

        let low = make_thread(6, SchedClass::Regular, 1);
        low.set_state(ThreadState::Running);
        rq.lock().current = Some(Arc::clone(&low));

        let sent_before = ipi::sent_count();
        let high = make_thread(7, SchedClass::Server, 5);
        enqueue_on(4, high);
        assert!(ipi::sent_count() > sent_before);

        drain_cpu(4);
        let mut inner = rq.lock();
        let idle = inner.idle.clone();
        inner.current = idle;
    }

    #[test]
    fn test_tick_expires_slice_and_raises_resched() {
        let _guard = test_guard();
        ensure_cpu(5);
        drain_cpu(5);
        let rq = runqueue(5).unwrap();

        let t = make_thread(8, SchedClass::Regular, 16);
        t.set_state(ThreadState::Running);
        t.set_timeslice(2);
        rq.lock().current = Some(Arc::clone(&t));

        tick_on(5);
        assert!(!t.needs_resched());
        tick_on(5);
        assert!(t.needs_resched());

        t.clear_flag(ThreadFlags::NEED_RESCHED);
        let mut inner = rq.lock();
        let idle = inner.idle.clone();
        inner.current = idle;
    }

    #[test]
    fn test_tick_cadence_raises_balance_flag() {
        let _guard = test_guard();
        ensure_cpu(6);
        let _ = take_need_balance();
        for _ in 0..LOAD_BALANCE_INTERVAL {
            tick_on(6);
        }
        assert!(take_need_balance());
        assert!(!take_need_balance());
    }

    #[test]
    fn test_stats_snapshot() {
        let _guard = test_guard();
        ensure_cpu(7);
        drain_cpu(7);
        let before = stats(7).unwrap();
        enqueue_on(7, make_thread(9, SchedClass::Regular, 16));
        let after = stats(7).unwrap();
        assert_eq!(after.nr_running, before.nr_running + 1);
        drain_cpu(7);
    }
}
