//! # Thread Records
//!
//! The thread control block and the priority model.
//!
//! Priorities live in a 5-class × 32-level space. A thread's dynamic
//! priority is the global value `class·32 + clamp(base + boost, 0, 31)`
//! and is what every comparison uses; the queue level within its class
//! is the value modulo 32. The transient boost decays on a tick
//! countdown back to the base priority.
//!
//! Scheduling fields are atomics: the record is shared through `Arc`
//! between the registry, the run queues, and wait channels, and fields
//! are only mutated under the appropriate run-queue or registry lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicI8, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use alloc::boxed::Box;
use arrayvec::ArrayString;
use orion_hal::arch::x86_64::context::Context;

// =============================================================================
// Identifiers
// =============================================================================

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

/// Owning-process identifier (processes themselves are managed by a
/// collaborator; the scheduler only groups threads by them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

// =============================================================================
// Priority Model
// =============================================================================

/// Priority levels per class.
pub const PRIO_LEVELS: u8 = 32;

/// Number of scheduling classes.
pub const NUM_CLASSES: u8 = 5;

/// Highest global dynamic priority.
pub const MAX_GLOBAL_PRIORITY: u8 = NUM_CLASSES * PRIO_LEVELS - 1;

/// Scheduling class, ordered low → high. Classes compare before levels:
/// any runnable thread of a higher class beats every thread of a lower
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SchedClass {
    /// Runs only when nothing else is runnable.
    Idle = 0,
    /// Default time-sharing class.
    Regular = 1,
    /// Time-critical work.
    TimeCritical = 2,
    /// Fixed-high server class.
    Server = 3,
    /// Hard real-time; reserved for kernel-internal callers.
    Realtime = 4,
}

impl From<u8> for SchedClass {
    fn from(value: u8) -> Self {
        match value {
            1 => SchedClass::Regular,
            2 => SchedClass::TimeCritical,
            3 => SchedClass::Server,
            4 => SchedClass::Realtime,
            _ => SchedClass::Idle,
        }
    }
}

/// Map an external (four-class, signed-delta) priority request into the
/// internal space. The canonical level formula is
/// `clamp((delta + 31) / 2, 0, 31)`; Realtime is not reachable from
/// outside.
pub fn map_external_priority(class: u32, delta: i32) -> Option<(SchedClass, u8)> {
    let class = match class {
        1 => SchedClass::Idle,
        2 => SchedClass::Regular,
        3 => SchedClass::TimeCritical,
        4 => SchedClass::Server,
        _ => return None,
    };
    let level = ((delta + 31) / 2).clamp(0, 31) as u8;
    Some((class, level))
}

// =============================================================================
// State & Flags
// =============================================================================

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Queued on exactly one run queue.
    Ready = 0,
    /// The `current` of exactly one run queue.
    Running = 1,
    /// Parked on a wait channel.
    Blocked = 2,
    /// Exited; awaiting reaping.
    Zombie = 3,
    /// Suspended; not runnable until resumed.
    Suspended = 4,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> Self {
        match value {
            1 => ThreadState::Running,
            2 => ThreadState::Blocked,
            3 => ThreadState::Zombie,
            4 => ThreadState::Suspended,
            _ => ThreadState::Ready,
        }
    }
}

bitflags::bitflags! {
    /// Thread flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Kernel-internal thread.
        const KERNEL      = 1 << 0;
        /// A CPU's idle thread; never enqueued.
        const IDLE        = 1 << 1;
        /// Must pass through the scheduler at the next opportunity.
        const NEED_RESCHED = 1 << 2;
        /// In flight between run queues.
        const MIGRATING   = 1 << 3;
        /// Hard affinity; the balancer must not move it.
        const BOUND       = 1 << 4;
        /// Kill requested; the scheduler retires it at the next pass.
        const TERMINATING = 1 << 5;
    }
}

/// Affinity mask allowing every CPU.
pub const AFFINITY_ALL: u64 = u64::MAX;

/// Wait result: normal wake.
pub const WAIT_OK: i32 = 0;
/// Wait result: wait cancelled by kill or explicit unblock.
pub const WAIT_CANCELLED: i32 = -1;

// =============================================================================
// Thread Control Block
// =============================================================================

/// A kernel thread.
pub struct Thread {
    /// Thread id.
    pub id: ThreadId,
    /// Owning process.
    pub process: ProcessId,
    /// Debug name.
    pub name: ArrayString<32>,

    // Scheduling.
    class: AtomicU8,
    base_priority: AtomicU8,
    dynamic_priority: AtomicU8,
    state: AtomicU8,
    flags: AtomicU32,

    // Time accounting, in ticks and nanoseconds.
    timeslice: AtomicU32,
    timeslice_max: AtomicU32,
    total_runtime: AtomicU64,
    last_run: AtomicU64,

    // Placement.
    affinity: AtomicU64,
    last_cpu: AtomicU32,
    preferred_cpu: AtomicU32,

    // Transient boost.
    boost: AtomicI8,
    boost_ticks: AtomicU8,

    // Waiting.
    wake_time: AtomicU64,
    wait_channel: AtomicUsize,
    wait_result: AtomicI32,
    suspend_count: AtomicU32,

    // Storage. The stack buffer is owned by the record for the
    // thread's whole lifetime.
    stack: Option<Box<[u8]>>,
    /// Saved CPU context; exclusively owned by the scheduler of the CPU
    /// switching this thread.
    context: UnsafeCell<Context>,
    /// Vector-extension state, allocated lazily on first use.
    vector_state: UnsafeCell<Option<Box<[u8]>>>,

    // Statistics.
    context_switches: AtomicU64,
    voluntary_switches: AtomicU64,
    involuntary_switches: AtomicU64,
}

// The UnsafeCell fields are only touched by the CPU that owns the
// thread at that moment (scheduler context-switch path).
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

/// Default time slice in ticks (one tick per millisecond).
pub const DEFAULT_TIMESLICE: u32 = 31;
/// Minimum configurable time slice.
pub const MIN_TIMESLICE: u32 = 1;
/// Maximum configurable time slice.
pub const MAX_TIMESLICE: u32 = 1000;

impl Thread {
    /// Create a thread record. Scheduling defaults: Regular class, base
    /// priority 16, full affinity, preferred CPU as given.
    pub fn new(
        id: ThreadId,
        process: ProcessId,
        name: &str,
        flags: ThreadFlags,
        stack: Option<Box<[u8]>>,
        preferred_cpu: u32,
    ) -> Self {
        let mut debug_name = ArrayString::new();
        for ch in name.chars() {
            if debug_name.try_push(ch).is_err() {
                break;
            }
        }

        let thread = Self {
            id,
            process,
            name: debug_name,
            class: AtomicU8::new(SchedClass::Regular as u8),
            base_priority: AtomicU8::new(16),
            dynamic_priority: AtomicU8::new(0),
            state: AtomicU8::new(ThreadState::Suspended as u8),
            flags: AtomicU32::new(flags.bits()),
            timeslice: AtomicU32::new(DEFAULT_TIMESLICE),
            timeslice_max: AtomicU32::new(DEFAULT_TIMESLICE),
            total_runtime: AtomicU64::new(0),
            last_run: AtomicU64::new(0),
            affinity: AtomicU64::new(AFFINITY_ALL),
            last_cpu: AtomicU32::new(preferred_cpu),
            preferred_cpu: AtomicU32::new(preferred_cpu),
            boost: AtomicI8::new(0),
            boost_ticks: AtomicU8::new(0),
            wake_time: AtomicU64::new(0),
            wait_channel: AtomicUsize::new(0),
            wait_result: AtomicI32::new(WAIT_OK),
            suspend_count: AtomicU32::new(0),
            stack,
            context: UnsafeCell::new(Context::empty()),
            vector_state: UnsafeCell::new(None),
            context_switches: AtomicU64::new(0),
            voluntary_switches: AtomicU64::new(0),
            involuntary_switches: AtomicU64::new(0),
        };
        thread.recompute_dynamic_priority();
        thread
    }

    // -------------------------------------------------------------------------
    // State & flags
    // -------------------------------------------------------------------------

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    /// Transition the lifecycle state.
    #[inline]
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Current flags.
    #[inline]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set flags.
    #[inline]
    pub fn set_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Clear flags.
    #[inline]
    pub fn clear_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Whether the reschedule flag is raised.
    #[inline]
    pub fn needs_resched(&self) -> bool {
        self.flags().contains(ThreadFlags::NEED_RESCHED)
    }

    // -------------------------------------------------------------------------
    // Priority
    // -------------------------------------------------------------------------

    /// Scheduling class.
    #[inline]
    pub fn class(&self) -> SchedClass {
        SchedClass::from(self.class.load(Ordering::Relaxed))
    }

    /// Base priority within the class, `[0, 31]`.
    #[inline]
    pub fn base_priority(&self) -> u8 {
        self.base_priority.load(Ordering::Relaxed)
    }

    /// Global dynamic priority, `[0, MAX_GLOBAL_PRIORITY]`.
    #[inline]
    pub fn dynamic_priority(&self) -> u8 {
        self.dynamic_priority.load(Ordering::Relaxed)
    }

    /// Queue level within the class.
    #[inline]
    pub fn queue_level(&self) -> u8 {
        self.dynamic_priority() % PRIO_LEVELS
    }

    /// Set class and base level; the caller re-queues as needed.
    pub fn set_priority(&self, class: SchedClass, level: u8) {
        self.class.store(class as u8, Ordering::SeqCst);
        self.base_priority.store(level.min(31), Ordering::SeqCst);
        self.recompute_dynamic_priority();
    }

    /// Apply a transient boost that decays after `ticks` ticks.
    pub fn apply_boost(&self, boost: i8, ticks: u8) {
        self.boost.store(boost, Ordering::SeqCst);
        self.boost_ticks.store(ticks, Ordering::SeqCst);
        self.recompute_dynamic_priority();
    }

    /// Tick the boost countdown; true when the boost just decayed.
    pub fn decay_boost(&self) -> bool {
        let remaining = self.boost_ticks.load(Ordering::Relaxed);
        if remaining == 0 {
            return false;
        }
        if self.boost_ticks.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.boost.store(0, Ordering::SeqCst);
            self.recompute_dynamic_priority();
            return true;
        }
        false
    }

    fn recompute_dynamic_priority(&self) {
        let class = self.class.load(Ordering::Relaxed);
        let base = self.base_priority.load(Ordering::Relaxed) as i32;
        let boost = self.boost.load(Ordering::Relaxed) as i32;
        let level = (base + boost).clamp(0, 31) as u8;
        let global = class * PRIO_LEVELS + level;
        debug_assert!(global <= MAX_GLOBAL_PRIORITY);
        self.dynamic_priority.store(global, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Time accounting
    // -------------------------------------------------------------------------

    /// Remaining time slice in ticks.
    #[inline]
    pub fn timeslice(&self) -> u32 {
        self.timeslice.load(Ordering::Relaxed)
    }

    /// Overwrite the remaining slice.
    #[inline]
    pub fn set_timeslice(&self, ticks: u32) {
        self.timeslice.store(ticks, Ordering::SeqCst);
    }

    /// Refill the slice from its maximum.
    #[inline]
    pub fn refill_timeslice(&self) {
        self.timeslice
            .store(self.timeslice_max.load(Ordering::Relaxed), Ordering::SeqCst);
    }

    /// Burn one tick of slice; true when it just reached zero.
    pub fn tick_timeslice(&self) -> bool {
        let current = self.timeslice.load(Ordering::Relaxed);
        if current == 0 {
            return false;
        }
        self.timeslice.store(current - 1, Ordering::SeqCst);
        current == 1
    }

    /// Configure the maximum slice, clamped to the legal range.
    pub fn set_timeslice_max(&self, ticks: u32) {
        self.timeslice_max
            .store(ticks.clamp(MIN_TIMESLICE, MAX_TIMESLICE), Ordering::SeqCst);
    }

    /// Accumulated runtime in nanoseconds.
    pub fn total_runtime(&self) -> u64 {
        self.total_runtime.load(Ordering::Relaxed)
    }

    /// Add to the accumulated runtime.
    pub fn account_runtime(&self, delta_ns: u64) {
        self.total_runtime.fetch_add(delta_ns, Ordering::Relaxed);
    }

    /// Timestamp of the last dispatch.
    pub fn last_run(&self) -> u64 {
        self.last_run.load(Ordering::Relaxed)
    }

    /// Record a dispatch timestamp.
    pub fn set_last_run(&self, now_ns: u64) {
        self.last_run.store(now_ns, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Affinity mask.
    #[inline]
    pub fn affinity(&self) -> u64 {
        self.affinity.load(Ordering::Acquire)
    }

    /// Replace the affinity mask.
    #[inline]
    pub fn set_affinity(&self, mask: u64) {
        self.affinity.store(mask, Ordering::SeqCst);
    }

    /// CPU whose run queue last held (or holds) this thread.
    #[inline]
    pub fn last_cpu(&self) -> u32 {
        self.last_cpu.load(Ordering::Acquire)
    }

    /// Record the owning CPU.
    #[inline]
    pub fn set_last_cpu(&self, cpu: u32) {
        self.last_cpu.store(cpu, Ordering::Release);
    }

    /// Cache-hot placement hint.
    #[inline]
    pub fn preferred_cpu(&self) -> u32 {
        self.preferred_cpu.load(Ordering::Acquire)
    }

    /// Update the placement hint.
    #[inline]
    pub fn set_preferred_cpu(&self, cpu: u32) {
        self.preferred_cpu.store(cpu, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Absolute wake deadline for timed sleeps (ns).
    pub fn wake_time(&self) -> u64 {
        self.wake_time.load(Ordering::Acquire)
    }

    /// Set the wake deadline.
    pub fn set_wake_time(&self, deadline_ns: u64) {
        self.wake_time.store(deadline_ns, Ordering::SeqCst);
    }

    /// Wait channel this thread is parked on (0 = none).
    pub fn wait_channel(&self) -> usize {
        self.wait_channel.load(Ordering::Acquire)
    }

    /// Publish the wait channel.
    pub fn set_wait_channel(&self, channel: usize) {
        self.wait_channel.store(channel, Ordering::SeqCst);
    }

    /// Result of the last wait.
    pub fn wait_result(&self) -> i32 {
        self.wait_result.load(Ordering::Acquire)
    }

    /// Deliver a wait result.
    pub fn set_wait_result(&self, result: i32) {
        self.wait_result.store(result, Ordering::SeqCst);
    }

    /// Suspension depth.
    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    /// Increment the suspension depth; returns the new value.
    pub fn suspend_inc(&self) -> u32 {
        self.suspend_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Try to decrement the suspension depth; `None` on underflow.
    pub fn suspend_dec(&self) -> Option<u32> {
        let mut current = self.suspend_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.suspend_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(observed) => current = observed,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Storage & statistics
    // -------------------------------------------------------------------------

    /// Kernel stack base address (0 for stack-less bootstrap threads).
    pub fn stack_base(&self) -> u64 {
        self.stack
            .as_ref()
            .map(|buf| buf.as_ptr() as u64)
            .unwrap_or(0)
    }

    /// Kernel stack size.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map(|buf| buf.len()).unwrap_or(0)
    }

    /// Saved-context pointer for the switch path.
    ///
    /// # Safety
    ///
    /// Only the scheduler of the CPU that owns this thread's execution
    /// may dereference it, and never concurrently.
    pub unsafe fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    /// Allocate the vector-extension save area.
    ///
    /// # Safety
    ///
    /// Must run before the record is published (no concurrent access).
    pub unsafe fn init_vector_state(&self, size: usize) {
        unsafe {
            *self.vector_state.get() = Some(alloc::vec![0u8; size].into_boxed_slice());
        }
    }

    /// Whether a vector save area was allocated.
    pub fn has_vector_state(&self) -> bool {
        unsafe { (*self.vector_state.get()).is_some() }
    }

    /// Raw pointer to the vector save area for the state-switch path.
    ///
    /// # Safety
    ///
    /// Same ownership rules as [`Thread::context_ptr`].
    pub unsafe fn vector_state_ptr(&self) -> Option<*mut u8> {
        unsafe { (*self.vector_state.get()).as_mut().map(|b| b.as_mut_ptr()) }
    }

    /// Count a dispatch.
    pub fn count_switch(&self, voluntary: bool) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
        if voluntary {
            self.voluntary_switches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.involuntary_switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// (total, voluntary, involuntary) switch counts.
    pub fn switch_counts(&self) -> (u64, u64, u64) {
        (
            self.context_switches.load(Ordering::Relaxed),
            self.voluntary_switches.load(Ordering::Relaxed),
            self.involuntary_switches.load(Ordering::Relaxed),
        )
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("class", &self.class())
            .field("dynamic_priority", &self.dynamic_priority())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: u32) -> Thread {
        Thread::new(
            ThreadId(id),
            ProcessId(1),
            "test",
            ThreadFlags::empty(),
            None,
            0,
        )
    }

    #[test]
    fn test_defaults() {
        let t = thread(1);
        assert_eq!(t.class(), SchedClass::Regular);
        assert_eq!(t.base_priority(), 16);
        assert_eq!(t.dynamic_priority(), 32 + 16);
        assert_eq!(t.state(), ThreadState::Suspended);
        assert_eq!(t.affinity(), AFFINITY_ALL);
        assert_eq!(t.timeslice(), DEFAULT_TIMESLICE);
    }

    #[test]
    fn test_external_mapping_canonical() {
        // level = clamp((delta + 31) / 2, 0, 31), class direct.
        assert_eq!(
            map_external_priority(2, 0),
            Some((SchedClass::Regular, 15))
        );
        assert_eq!(map_external_priority(1, -31), Some((SchedClass::Idle, 0)));
        assert_eq!(
            map_external_priority(4, 31),
            Some((SchedClass::Server, 31))
        );
        assert_eq!(
            map_external_priority(3, 5),
            Some((SchedClass::TimeCritical, 18))
        );
        // Realtime is internal-only; 5 is not a valid external class.
        assert_eq!(map_external_priority(5, 0), None);
        assert_eq!(map_external_priority(0, 0), None);
    }

    #[test]
    fn test_boost_and_decay() {
        let t = thread(2);
        t.apply_boost(4, 2);
        assert_eq!(t.dynamic_priority(), 32 + 20);

        assert!(!t.decay_boost());
        assert_eq!(t.dynamic_priority(), 32 + 20);
        assert!(t.decay_boost());
        assert_eq!(t.dynamic_priority(), 32 + 16);
        // Nothing left to decay.
        assert!(!t.decay_boost());
    }

    #[test]
    fn test_boost_clamps_within_class() {
        let t = thread(3);
        t.apply_boost(120, 5);
        assert_eq!(t.dynamic_priority(), 32 + 31);
        t.apply_boost(-120, 5);
        assert_eq!(t.dynamic_priority(), 32);
        assert_eq!(t.queue_level(), 0);
    }

    #[test]
    fn test_dynamic_priority_spans_classes() {
        let t = thread(4);
        t.set_priority(SchedClass::Realtime, 31);
        assert_eq!(t.dynamic_priority(), MAX_GLOBAL_PRIORITY);
        t.set_priority(SchedClass::Idle, 0);
        assert_eq!(t.dynamic_priority(), 0);
    }

    #[test]
    fn test_timeslice_tick() {
        let t = thread(5);
        t.set_timeslice(2);
        assert!(!t.tick_timeslice());
        assert!(t.tick_timeslice());
        assert_eq!(t.timeslice(), 0);
        // Already expired; no further edge.
        assert!(!t.tick_timeslice());
    }

    #[test]
    fn test_timeslice_max_clamped() {
        let t = thread(6);
        t.set_timeslice_max(0);
        t.refill_timeslice();
        assert_eq!(t.timeslice(), MIN_TIMESLICE);
        t.set_timeslice_max(100_000);
        t.refill_timeslice();
        assert_eq!(t.timeslice(), MAX_TIMESLICE);
    }

    #[test]
    fn test_suspend_depth() {
        let t = thread(7);
        assert_eq!(t.suspend_dec(), None);
        assert_eq!(t.suspend_inc(), 1);
        assert_eq!(t.suspend_inc(), 2);
        assert_eq!(t.suspend_dec(), Some(1));
        assert_eq!(t.suspend_dec(), Some(0));
        assert_eq!(t.suspend_dec(), None);
    }

    #[test]
    fn test_name_truncated() {
        let t = Thread::new(
            ThreadId(8),
            ProcessId(1),
            "a-name-well-beyond-thirty-two-characters-long",
            ThreadFlags::empty(),
            None,
            0,
        );
        assert_eq!(t.name.len(), 32);
    }
}
