//! # Thread-Lifecycle API
//!
//! The external surface of the execution subsystem: create, kill,
//! suspend and resume, scoped priority changes in the four-class
//! external space, sleep, critical sections, affinity, and the
//! system-information query. All operations report [`Status`] codes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use orion_hal::arch::x86_64::apic::ipi;
use orion_hal::arch::x86_64::smp::{self, cpu_info, per_cpu};
use orion_hal::PAGE_SIZE;

use crate::registry::{self, Process};
use crate::sched;
use crate::thread::{
    map_external_priority, ProcessId, Thread, ThreadFlags, ThreadId, ThreadState,
};
use crate::wait;

// =============================================================================
// Status Codes
// =============================================================================

/// Result of a thread-lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Operation completed.
    Success = 0,
    /// Malformed argument (null buffer, empty affinity, zero size).
    InvalidParameter,
    /// No such thread.
    InvalidThreadId,
    /// No such process.
    InvalidProcessId,
    /// Priority class outside the external range.
    InvalidClass,
    /// Priority delta outside `[-31, 31]`.
    InvalidDelta,
    /// Unknown priority scope.
    InvalidScope,
    /// Resume of a thread that is not suspended.
    NotFrozen,
    /// Critical-section exit without a matching enter.
    CritSecUnderflow,
    /// Allocation failure.
    InsufficientMemory,
}

impl Status {
    /// Whether the operation succeeded.
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

/// Scope of a priority change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityScope {
    /// Every thread of one process.
    Process,
    /// A process and its descendants (the scheduler resolves this to
    /// the process's thread set; descent is the process manager's
    /// concern).
    ProcessTree,
    /// A single thread.
    Thread,
}

bitflags::bitflags! {
    /// Thread-creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// Enqueue immediately.
        const READY = 1 << 0;
        /// Leave suspended until resumed.
        const SUSPENDED = 1 << 1;
    }
}

/// Thread entry point signature.
pub type ThreadEntry = extern "C" fn(usize) -> !;

/// Smallest kernel stack handed to a new thread.
pub const MIN_STACK_SIZE: usize = PAGE_SIZE;

// =============================================================================
// Creation & Destruction
// =============================================================================

/// Create a thread in `process`.
///
/// Defaults: Regular class at base priority 16, full affinity, the
/// caller's CPU as placement hint. The stack request is clamped to a
/// page-aligned minimum. `CreateFlags::READY` enqueues immediately;
/// otherwise the thread starts suspended.
pub fn create_thread(
    process: ProcessId,
    entry: ThreadEntry,
    arg: usize,
    flags: CreateFlags,
    stack_size: usize,
    name: &str,
) -> Result<ThreadId, Status> {
    if registry::lookup_process(process).is_none() {
        return Err(Status::InvalidProcessId);
    }

    let stack_size = stack_size
        .max(MIN_STACK_SIZE)
        .div_ceil(PAGE_SIZE)
        * PAGE_SIZE;
    let stack: Box<[u8]> = vec![0u8; stack_size].into_boxed_slice();

    let tid = registry::allocate_tid();
    let thread = Arc::new(Thread::new(
        tid,
        process,
        name,
        ThreadFlags::empty(),
        Some(stack),
        per_cpu::current_cpu_id(),
    ));

    // Seed the switch frame so the first dispatch lands in entry(arg).
    let stack_top = (thread.stack_base() + thread.stack_size() as u64) & !0xF;
    unsafe {
        (*thread.context_ptr()).init(stack_top as *mut u8, entry, arg);
    }

    // FXSAVE-style vector area when the CPU can use it; the record is
    // not published yet, so the unsafe init is single-threaded.
    let cpu = per_cpu::current_cpu_id() as usize;
    if let Some(info) = cpu_info::get_cpu_info(cpu) {
        if info.features().contains(cpu_info::CpuFeatures::XSAVE) {
            unsafe { thread.init_vector_state(512) };
        }
    }

    registry::insert_thread(Arc::clone(&thread));

    if flags.contains(CreateFlags::READY) {
        thread.set_state(ThreadState::Ready);
        sched::enqueue_thread(thread);
    } else {
        thread.set_state(ThreadState::Suspended);
        thread.suspend_inc();
    }

    Ok(tid)
}

/// Reap a Zombie thread's record.
pub fn destroy_thread(tid: ThreadId) -> Status {
    let Some(thread) = registry::lookup_thread(tid) else {
        return Status::InvalidThreadId;
    };
    if thread.state() != ThreadState::Zombie {
        return Status::InvalidParameter;
    }
    registry::remove_thread(tid);
    Status::Success
}

/// Request termination of another thread. Self-kill is rejected; a
/// blocked target wakes with the cancellation result; a target running
/// on another CPU is kicked so it passes through its scheduler.
pub fn kill_thread(tid: ThreadId) -> Status {
    let Some(thread) = registry::lookup_thread(tid) else {
        return Status::InvalidThreadId;
    };
    if let Some(current) = sched::current_thread() {
        if current.id == tid {
            return Status::InvalidThreadId;
        }
    }

    thread.set_flag(ThreadFlags::TERMINATING);

    match thread.state() {
        ThreadState::Blocked => {
            wait::cancel_wait(&thread);
        }
        ThreadState::Running => {
            let cpu = thread.last_cpu();
            if cpu != per_cpu::current_cpu_id() {
                if let Some(info) = cpu_info::get_cpu_info(cpu as usize) {
                    ipi::send_reschedule(info.apic_id());
                }
            } else {
                thread.set_flag(ThreadFlags::NEED_RESCHED);
            }
        }
        ThreadState::Ready => {
            // Retired when the queue hands it to a scheduler pass.
        }
        _ => {}
    }

    Status::Success
}

// =============================================================================
// Suspend / Resume
// =============================================================================

/// Suspend a thread; counts nest.
pub fn suspend_thread(tid: ThreadId) -> Status {
    let Some(thread) = registry::lookup_thread(tid) else {
        return Status::InvalidThreadId;
    };

    thread.suspend_inc();

    match thread.state() {
        ThreadState::Ready => {
            sched::dequeue_thread(&thread);
            thread.set_state(ThreadState::Suspended);
        }
        ThreadState::Running => {
            thread.set_state(ThreadState::Suspended);
            let cpu = thread.last_cpu();
            if cpu == per_cpu::current_cpu_id() {
                sched::schedule();
            } else if let Some(info) = cpu_info::get_cpu_info(cpu as usize) {
                ipi::send_reschedule(info.apic_id());
            }
        }
        // Blocked or already suspended: the raised count is enough.
        _ => {}
    }

    Status::Success
}

/// Resume a suspended thread; the last resume re-queues it.
pub fn resume_thread(tid: ThreadId) -> Status {
    let Some(thread) = registry::lookup_thread(tid) else {
        return Status::InvalidThreadId;
    };

    match thread.suspend_dec() {
        None => Status::NotFrozen,
        Some(0) => {
            if thread.state() == ThreadState::Suspended {
                thread.set_state(ThreadState::Ready);
                sched::enqueue_thread(thread);
            }
            Status::Success
        }
        Some(_) => Status::Success,
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Change priority for a scope's threads in the external four-class
/// space. Class 0 keeps the current class; the level is the canonical
/// `clamp((delta + 31) / 2, 0, 31)`.
pub fn set_priority(scope: PriorityScope, class: u32, delta: i32, id: u32) -> Status {
    if class > 4 {
        return Status::InvalidClass;
    }
    if !(-31..=31).contains(&delta) {
        return Status::InvalidDelta;
    }

    let mapped = if class == 0 {
        None
    } else {
        match map_external_priority(class, delta) {
            Some(mapped) => Some(mapped),
            None => return Status::InvalidClass,
        }
    };
    let level = ((delta + 31) / 2).clamp(0, 31) as u8;

    let targets: Vec<Arc<Thread>> = match scope {
        PriorityScope::Thread => {
            let Some(thread) = registry::lookup_thread(ThreadId(id)) else {
                return Status::InvalidThreadId;
            };
            vec![thread]
        }
        PriorityScope::Process | PriorityScope::ProcessTree => {
            let pid = ProcessId(id);
            if registry::lookup_process(pid).is_none() {
                return Status::InvalidProcessId;
            }
            registry::process_threads(pid)
        }
    };

    for thread in targets {
        apply_priority_change(&thread, mapped.map(|(c, _)| c), level);
    }
    Status::Success
}

fn apply_priority_change(
    thread: &Arc<Thread>,
    new_class: Option<crate::thread::SchedClass>,
    level: u8,
) {
    let _global = sched::global_lock();

    let was_queued = thread.state() == ThreadState::Ready && sched::dequeue_thread(thread);

    let class = new_class.unwrap_or_else(|| thread.class());
    thread.set_priority(class, level);

    if was_queued {
        thread.set_state(ThreadState::Ready);
        sched::enqueue_thread(Arc::clone(thread));
    }
}

// =============================================================================
// Sleep
// =============================================================================

/// Sleep for `ms` milliseconds; zero yields the remainder of the slice.
pub fn sleep(ms: u64) -> Status {
    if ms == 0 {
        sched::yield_now();
        return Status::Success;
    }
    sleep_until(sched::now_ns() + ms * 1_000_000)
}

/// Sleep until an absolute deadline on the scheduler clock. Wakes early
/// with Success when cancelled by a kill or explicit unblock.
pub fn sleep_until(deadline_ns: u64) -> Status {
    wait::block_current(wait::sleep_channel(), Some(deadline_ns));
    Status::Success
}

// =============================================================================
// Critical Sections
// =============================================================================

/// Raise the calling process's critical-section depth and disable
/// preemption on this CPU.
pub fn enter_critical_section() -> Status {
    let Some(process) = current_process() else {
        return Status::InvalidProcessId;
    };
    enter_critical_section_for(&process)
}

/// Lower the depth; underflow is reported without touching the
/// preemption counter.
pub fn exit_critical_section() -> Status {
    let Some(process) = current_process() else {
        return Status::InvalidProcessId;
    };
    exit_critical_section_for(&process)
}

/// Critical-section enter against an explicit process record.
pub fn enter_critical_section_for(process: &Arc<Process>) -> Status {
    process.critsec_enter();
    sched::preempt_disable();
    Status::Success
}

/// Critical-section exit against an explicit process record.
pub fn exit_critical_section_for(process: &Arc<Process>) -> Status {
    // The underflow check comes first: a bogus exit must not disturb
    // the preemption counter.
    match process.critsec_exit() {
        None => Status::CritSecUnderflow,
        Some(_) => {
            sched::preempt_enable();
            Status::Success
        }
    }
}

fn current_process() -> Option<Arc<Process>> {
    let current = sched::current_thread()?;
    registry::lookup_process(current.process)
}

// =============================================================================
// Affinity
// =============================================================================

/// Replace a thread's CPU affinity. The mask must intersect the online
/// set; a Ready thread parked on a now-excluded CPU is re-queued
/// immediately, a Running thread drifts at its next reschedule.
pub fn set_thread_affinity(tid: ThreadId, mask: u64) -> Status {
    let Some(thread) = registry::lookup_thread(tid) else {
        return Status::InvalidThreadId;
    };
    let online = smp::online_mask();
    if mask & online == 0 {
        return Status::InvalidParameter;
    }

    let _global = sched::global_lock();
    thread.set_affinity(mask);

    if thread.state() == ThreadState::Ready && mask & (1 << thread.last_cpu()) == 0 {
        if sched::dequeue_thread(&thread) {
            thread.set_preferred_cpu((mask & online).trailing_zeros());
            thread.set_state(ThreadState::Ready);
            sched::enqueue_thread(Arc::clone(&thread));
        }
    }

    Status::Success
}

/// Read a thread's affinity mask.
pub fn get_thread_affinity(tid: ThreadId) -> Result<u64, Status> {
    registry::lookup_thread(tid)
        .map(|t| t.affinity())
        .ok_or(Status::InvalidThreadId)
}

// =============================================================================
// System Information
// =============================================================================

/// Query keys understood by [`query_system_info`]; everything else
/// reads as zero.
pub mod sysinfo {
    /// Number of online processors.
    pub const PROCESSOR_COUNT: u32 = 1;
    /// Index of the calling processor.
    pub const CURRENT_PROCESSOR: u32 = 2;
    /// Largest private memory allocation (bytes).
    pub const MAX_PRIVATE_MEM: u32 = 3;
    /// Largest shared memory allocation (bytes).
    pub const MAX_SHARED_MEM: u32 = 4;
    /// Kernel major version.
    pub const VERSION_MAJOR: u32 = 5;
    /// Kernel minor version.
    pub const VERSION_MINOR: u32 = 6;
}

/// Fill `buf` with the values of keys `start..=last`.
pub fn query_system_info(start: u32, last: u32, buf: &mut [u32]) -> Status {
    if start > last || buf.len() < (last - start + 1) as usize {
        return Status::InvalidParameter;
    }

    for (slot, key) in buf.iter_mut().zip(start..=last) {
        *slot = match key {
            sysinfo::PROCESSOR_COUNT => smp::cpu_count(),
            sysinfo::CURRENT_PROCESSOR => per_cpu::current_cpu_id(),
            sysinfo::MAX_PRIVATE_MEM => 512 * 1024 * 1024,
            sysinfo::MAX_SHARED_MEM => 256 * 1024 * 1024,
            sysinfo::VERSION_MAJOR => 0,
            sysinfo::VERSION_MINOR => 1,
            _ => 0,
        };
    }
    Status::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{init_cpu, runqueue};
    use crate::test_guard;
    use crate::thread::SchedClass;

    extern "C" fn noop_entry(_arg: usize) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn ensure_cpu0() {
        let _ = init_cpu(0, 0);
        smp::set_cpu_online(0, true);
    }

    fn drain_cpu0() {
        if let Some(rq) = runqueue(0) {
            let mut inner = rq.lock();
            while inner.take_next().is_some() {}
        }
    }

    fn fresh_process(id: u32) -> Arc<Process> {
        registry::register_process(ProcessId(id))
    }

    #[test]
    fn test_create_requires_process() {
        let _guard = test_guard();
        ensure_cpu0();
        assert_eq!(
            create_thread(
                ProcessId(7777),
                noop_entry,
                0,
                CreateFlags::READY,
                8192,
                "orphan"
            ),
            Err(Status::InvalidProcessId)
        );
    }

    #[test]
    fn test_create_ready_enqueues_with_defaults() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();
        fresh_process(100);

        let tid = create_thread(
            ProcessId(100),
            noop_entry,
            0,
            CreateFlags::READY,
            0,
            "worker",
        )
        .unwrap();
        let thread = registry::lookup_thread(tid).unwrap();

        assert_eq!(thread.state(), ThreadState::Ready);
        assert_eq!(thread.class(), SchedClass::Regular);
        assert_eq!(thread.base_priority(), 16);
        assert_eq!(thread.affinity(), u64::MAX);
        // Stack clamped to the page-aligned minimum.
        assert_eq!(thread.stack_size(), MIN_STACK_SIZE);

        sched::dequeue_thread(&thread);
        registry::remove_thread(tid);
        drain_cpu0();
    }

    #[test]
    fn test_create_suspended_then_resume() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();
        fresh_process(101);

        let tid = create_thread(
            ProcessId(101),
            noop_entry,
            0,
            CreateFlags::SUSPENDED,
            8192,
            "frozen",
        )
        .unwrap();
        let thread = registry::lookup_thread(tid).unwrap();
        assert_eq!(thread.state(), ThreadState::Suspended);

        assert_eq!(resume_thread(tid), Status::Success);
        assert_eq!(thread.state(), ThreadState::Ready);
        // A second resume underflows.
        assert_eq!(resume_thread(tid), Status::NotFrozen);

        sched::dequeue_thread(&thread);
        registry::remove_thread(tid);
        drain_cpu0();
    }

    #[test]
    fn test_suspend_nesting() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();
        fresh_process(102);

        let tid = create_thread(
            ProcessId(102),
            noop_entry,
            0,
            CreateFlags::READY,
            8192,
            "nested",
        )
        .unwrap();
        let thread = registry::lookup_thread(tid).unwrap();

        assert_eq!(suspend_thread(tid), Status::Success);
        assert_eq!(suspend_thread(tid), Status::Success);
        assert_eq!(thread.state(), ThreadState::Suspended);

        assert_eq!(resume_thread(tid), Status::Success);
        assert_eq!(thread.state(), ThreadState::Suspended);
        assert_eq!(resume_thread(tid), Status::Success);
        assert_eq!(thread.state(), ThreadState::Ready);

        sched::dequeue_thread(&thread);
        registry::remove_thread(tid);
        drain_cpu0();
    }

    #[test]
    fn test_kill_blocked_thread_cancels_wait() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();
        fresh_process(103);

        let tid = create_thread(
            ProcessId(103),
            noop_entry,
            0,
            CreateFlags::READY,
            8192,
            "sleeper",
        )
        .unwrap();
        let thread = registry::lookup_thread(tid).unwrap();
        sched::dequeue_thread(&thread);
        wait::park(&thread, 0xABC0, Some(1_000_000_000));

        assert_eq!(kill_thread(tid), Status::Success);
        assert!(thread.flags().contains(ThreadFlags::TERMINATING));
        assert_eq!(thread.state(), ThreadState::Ready);
        assert_eq!(thread.wait_result(), crate::thread::WAIT_CANCELLED);

        sched::dequeue_thread(&thread);
        registry::remove_thread(tid);
        drain_cpu0();
    }

    #[test]
    fn test_kill_unknown_thread() {
        let _guard = test_guard();
        assert_eq!(kill_thread(ThreadId(0xFFFF_FF00)), Status::InvalidThreadId);
    }

    #[test]
    fn test_set_priority_validation_order() {
        let _guard = test_guard();
        assert_eq!(
            set_priority(PriorityScope::Thread, 9, 0, 1),
            Status::InvalidClass
        );
        assert_eq!(
            set_priority(PriorityScope::Thread, 2, 40, 1),
            Status::InvalidDelta
        );
        assert_eq!(
            set_priority(PriorityScope::Thread, 2, 0, 0xFFFF_FF01),
            Status::InvalidThreadId
        );
        assert_eq!(
            set_priority(PriorityScope::Process, 2, 0, 7778),
            Status::InvalidProcessId
        );
    }

    #[test]
    fn test_set_priority_process_scope() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();
        fresh_process(104);

        let t1 = create_thread(
            ProcessId(104),
            noop_entry,
            0,
            CreateFlags::SUSPENDED,
            8192,
            "a",
        )
        .unwrap();
        let t2 = create_thread(
            ProcessId(104),
            noop_entry,
            0,
            CreateFlags::SUSPENDED,
            8192,
            "b",
        )
        .unwrap();

        assert_eq!(
            set_priority(PriorityScope::Process, 3, 10, 104),
            Status::Success
        );
        for tid in [t1, t2] {
            let t = registry::lookup_thread(tid).unwrap();
            assert_eq!(t.class(), SchedClass::TimeCritical);
            // level = (10 + 31) / 2 = 20
            assert_eq!(t.base_priority(), 20);
            registry::remove_thread(tid);
        }
        drain_cpu0();
    }

    #[test]
    fn test_set_priority_requeues_ready_thread() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();
        fresh_process(105);

        let tid = create_thread(
            ProcessId(105),
            noop_entry,
            0,
            CreateFlags::READY,
            8192,
            "mover",
        )
        .unwrap();
        let thread = registry::lookup_thread(tid).unwrap();

        assert_eq!(
            set_priority(PriorityScope::Thread, 4, 31, tid.0),
            Status::Success
        );
        assert_eq!(thread.class(), SchedClass::Server);
        assert_eq!(thread.base_priority(), 31);
        assert_eq!(thread.state(), ThreadState::Ready);

        // It is queued at its new priority.
        let rq = runqueue(0).unwrap();
        let mut inner = rq.lock();
        let next = inner.take_next().unwrap();
        assert!(Arc::ptr_eq(&next, &thread));
        drop(inner);

        registry::remove_thread(tid);
        drain_cpu0();
    }

    #[test]
    fn test_critical_section_underflow() {
        let _guard = test_guard();
        let process = fresh_process(106);
        let preempt_before = sched::preempt_count();

        assert_eq!(
            exit_critical_section_for(&process),
            Status::CritSecUnderflow
        );
        // The underflow must leave the preempt counter alone.
        assert_eq!(sched::preempt_count(), preempt_before);

        assert_eq!(enter_critical_section_for(&process), Status::Success);
        assert_eq!(sched::preempt_count(), preempt_before + 1);
        assert_eq!(exit_critical_section_for(&process), Status::Success);
        assert_eq!(sched::preempt_count(), preempt_before);
    }

    #[test]
    fn test_affinity_validation_and_requeue() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();
        fresh_process(107);

        let tid = create_thread(
            ProcessId(107),
            noop_entry,
            0,
            CreateFlags::READY,
            8192,
            "pinned",
        )
        .unwrap();
        let thread = registry::lookup_thread(tid).unwrap();

        // Mask with no online CPU is rejected.
        let offline_only = !smp::online_mask();
        if offline_only != 0 {
            assert_eq!(
                set_thread_affinity(tid, offline_only),
                Status::InvalidParameter
            );
        }

        assert_eq!(set_thread_affinity(tid, 1 << 0), Status::Success);
        assert_eq!(get_thread_affinity(tid), Ok(1 << 0));
        assert_eq!(thread.last_cpu(), 0);

        assert_eq!(
            get_thread_affinity(ThreadId(0xFFFF_FF02)),
            Err(Status::InvalidThreadId)
        );

        sched::dequeue_thread(&thread);
        registry::remove_thread(tid);
        drain_cpu0();
    }

    #[test]
    fn test_query_system_info() {
        let _guard = test_guard();
        ensure_cpu0();

        let mut buf = [0u32; 6];
        assert_eq!(
            query_system_info(sysinfo::PROCESSOR_COUNT, sysinfo::VERSION_MINOR, &mut buf),
            Status::Success
        );
        assert_eq!(buf[0], smp::cpu_count());
        assert_eq!(buf[2], 512 * 1024 * 1024);
        assert_eq!(buf[3], 256 * 1024 * 1024);
        assert_eq!(buf[4], 0);
        assert_eq!(buf[5], 1);

        // Unknown keys read zero.
        let mut one = [7u32; 1];
        assert_eq!(query_system_info(40, 40, &mut one), Status::Success);
        assert_eq!(one[0], 0);

        // Short buffer rejected.
        let mut short = [0u32; 1];
        assert_eq!(
            query_system_info(1, 3, &mut short),
            Status::InvalidParameter
        );
    }

    #[test]
    fn test_sleep_zero_yields() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();
        assert_eq!(sleep(0), Status::Success);
    }
}
