//! # Per-CPU Data
//!
//! A small per-CPU area reachable through the GS segment base so the
//! scheduler can answer "which CPU am I on" with a single load:
//!
//! ```text
//! GS:0x00  self pointer
//! GS:0x08  logical CPU id
//! GS:0x10  APIC id
//! GS:0x18  current thread pointer
//! GS:0x20  kernel stack top
//! ```
//!
//! Until the segment base is installed on a CPU, `current_cpu_id()`
//! falls back to reading the interrupt-controller id and translating it
//! through the topology table. The preemption counters and per-CPU
//! flags live in the same records and are indexed directly, so remote
//! CPUs can observe them.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::cpu_info;
use super::SmpError;
use crate::arch::x86_64::apic::local;
use crate::MAX_CPUS;

// =============================================================================
// Layout
// =============================================================================

/// Offset of the self pointer.
pub const SELF_OFFSET: usize = 0x00;
/// Offset of the logical CPU id.
pub const CPU_ID_OFFSET: usize = 0x08;
/// Offset of the APIC id.
pub const APIC_ID_OFFSET: usize = 0x10;
/// Offset of the current thread pointer.
pub const CURRENT_THREAD_OFFSET: usize = 0x18;
/// Offset of the kernel stack top.
pub const KERNEL_STACK_OFFSET: usize = 0x20;

/// Validation magic ("ORIONCPU").
const PERCPU_MAGIC: u64 = 0x4F52_494F_4E43_5055;

bitflags::bitflags! {
    /// Per-CPU state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PerCpuFlags: u64 {
        /// Currently in an interrupt handler.
        const IN_IRQ = 1 << 0;
        /// CPU is running its idle thread.
        const IDLE = 1 << 1;
        /// CPU was stopped by the emergency-halt IPI.
        const HALTED = 1 << 2;
    }
}

/// Per-CPU data block.
#[repr(C, align(64))]
pub struct PerCpuData {
    /// Self pointer for GS-relative access (GS:0x00).
    self_ptr: AtomicU64,
    /// Logical CPU id (GS:0x08).
    cpu_id: AtomicU64,
    /// APIC id (GS:0x10).
    apic_id: AtomicU64,
    /// Current thread pointer (GS:0x18).
    current_thread: AtomicU64,
    /// Kernel stack top (GS:0x20).
    kernel_stack: AtomicU64,
    /// Preemption counter; positive defers involuntary preemption.
    preempt_count: AtomicU32,
    /// Interrupt nesting depth.
    irq_nesting: AtomicU32,
    /// State flags.
    flags: AtomicU64,
    /// Validation magic.
    magic: AtomicU64,
}

impl PerCpuData {
    const fn new() -> Self {
        Self {
            self_ptr: AtomicU64::new(0),
            cpu_id: AtomicU64::new(0),
            apic_id: AtomicU64::new(0),
            current_thread: AtomicU64::new(0),
            kernel_stack: AtomicU64::new(0),
            preempt_count: AtomicU32::new(0),
            irq_nesting: AtomicU32::new(0),
            flags: AtomicU64::new(0),
            magic: AtomicU64::new(0),
        }
    }

    /// Logical CPU id.
    #[inline]
    pub fn cpu_id(&self) -> u32 {
        self.cpu_id.load(Ordering::Relaxed) as u32
    }

    /// APIC id of this CPU.
    #[inline]
    pub fn apic_id(&self) -> u32 {
        self.apic_id.load(Ordering::Relaxed) as u32
    }

    /// Kernel stack top used on entry from lower privilege.
    #[inline]
    pub fn kernel_stack(&self) -> u64 {
        self.kernel_stack.load(Ordering::Acquire)
    }

    /// Publish the kernel stack top.
    #[inline]
    pub fn set_kernel_stack(&self, top: u64) {
        self.kernel_stack.store(top, Ordering::Release);
    }

    /// Current thread pointer (opaque to the HAL).
    #[inline]
    pub fn current_thread(&self) -> u64 {
        self.current_thread.load(Ordering::Acquire)
    }

    /// Publish the current thread pointer.
    #[inline]
    pub fn set_current_thread(&self, ptr: u64) {
        self.current_thread.store(ptr, Ordering::Release);
    }

    /// Current preemption count.
    #[inline]
    pub fn preempt_count(&self) -> u32 {
        self.preempt_count.load(Ordering::Relaxed)
    }

    /// Increment the preemption count.
    #[inline]
    pub fn preempt_disable(&self) {
        self.preempt_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the preemption count; returns the new value.
    #[inline]
    pub fn preempt_enable(&self) -> u32 {
        let prev = self.preempt_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "preempt_enable without preempt_disable");
        prev - 1
    }

    /// Enter interrupt context.
    #[inline]
    pub fn enter_irq(&self) {
        self.irq_nesting.fetch_add(1, Ordering::SeqCst);
        self.set_flag(PerCpuFlags::IN_IRQ);
    }

    /// Leave interrupt context.
    #[inline]
    pub fn exit_irq(&self) {
        if self.irq_nesting.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.clear_flag(PerCpuFlags::IN_IRQ);
        }
    }

    /// Whether this CPU is inside an interrupt handler.
    #[inline]
    pub fn in_irq(&self) -> bool {
        self.irq_nesting.load(Ordering::Relaxed) > 0
    }

    /// Current flags.
    pub fn flags(&self) -> PerCpuFlags {
        PerCpuFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Set a flag.
    pub fn set_flag(&self, flag: PerCpuFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    /// Clear a flag.
    pub fn clear_flag(&self, flag: PerCpuFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Relaxed) == PERCPU_MAGIC
            && self.self_ptr.load(Ordering::Relaxed) == self as *const _ as u64
    }
}

// =============================================================================
// Global Array
// =============================================================================

static PERCPU_DATA: [PerCpuData; MAX_CPUS] = [const { PerCpuData::new() }; MAX_CPUS];

/// Per-CPU area of a specific CPU.
pub fn percpu_for(cpu_id: usize) -> Option<&'static PerCpuData> {
    PERCPU_DATA.get(cpu_id)
}

/// Per-CPU area of the calling CPU.
#[inline]
pub fn current_percpu() -> &'static PerCpuData {
    &PERCPU_DATA[current_cpu_id() as usize]
}

fn init_percpu(cpu_id: usize, apic_id: u32) -> Result<&'static PerCpuData, SmpError> {
    let area = PERCPU_DATA.get(cpu_id).ok_or(SmpError::InvalidCpuId)?;
    area.self_ptr.store(area as *const _ as u64, Ordering::SeqCst);
    area.cpu_id.store(cpu_id as u64, Ordering::SeqCst);
    area.apic_id.store(apic_id as u64, Ordering::SeqCst);
    area.magic.store(PERCPU_MAGIC, Ordering::SeqCst);
    Ok(area)
}

/// Install the BSP's per-CPU segment.
pub fn init_bsp(apic_id: u32) -> Result<(), SmpError> {
    let area = init_percpu(0, apic_id)?;
    install_gs_base(area);
    Ok(())
}

/// Install an AP's per-CPU segment; runs on the AP itself.
pub fn init_ap(cpu_id: usize, apic_id: u32) -> Result<(), SmpError> {
    let area = init_percpu(cpu_id, apic_id)?;
    install_gs_base(area);
    Ok(())
}

// =============================================================================
// Fast CPU-Id Access
// =============================================================================

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        const IA32_GS_BASE: u32 = 0xC000_0101;

        fn install_gs_base(area: &'static PerCpuData) {
            let base = area as *const _ as u64;
            unsafe {
                core::arch::asm!(
                    "wrmsr",
                    in("ecx") IA32_GS_BASE,
                    in("eax") base as u32,
                    in("edx") (base >> 32) as u32,
                    options(nostack, preserves_flags),
                );
            }
        }

        /// The calling CPU's logical id: a single GS-relative load once
        /// the segment is installed, the APIC-id bootstrap path before.
        #[inline]
        pub fn current_cpu_id() -> u32 {
            let self_ptr: u64;
            unsafe {
                core::arch::asm!(
                    "mov {}, gs:[{}]",
                    out(reg) self_ptr,
                    const SELF_OFFSET,
                    options(nostack, readonly),
                );
            }
            if self_ptr != 0 {
                let area = unsafe { &*(self_ptr as *const PerCpuData) };
                if area.is_valid() {
                    return area.cpu_id();
                }
            }
            bootstrap_cpu_id()
        }
    } else {
        fn install_gs_base(_area: &'static PerCpuData) {}

        /// Host fallback: always the bootstrap path.
        #[inline]
        pub fn current_cpu_id() -> u32 {
            bootstrap_cpu_id()
        }
    }
}

/// Bootstrap path: read the hardware interrupt-controller id and map it
/// through the topology table; logical 0 before registration.
fn bootstrap_cpu_id() -> u32 {
    cpu_info::cpu_for_apic_id(local::read_self_id()).unwrap_or(0)
}
