//! # x86_64 Symmetric Multi-Processing
//!
//! CPU topology table, online/active masks, per-CPU data, and the AP
//! bring-up protocol.
//!
//! ## Boot Sequence
//!
//! 1. BSP consumes the firmware platform description and registers
//!    every enumerated processor
//! 2. BSP initializes its local APIC, per-CPU segment, allocator, and
//!    scheduler state
//! 3. For each enabled AP, serialized: INIT → SIPI → SIPI through the
//!    low-memory trampoline, handshake through the mailbox cell
//! 4. Each AP initializes its own APIC/per-CPU/scheduler state, raises
//!    the ready flag, and enters its idle loop
//! 5. APs that miss the 1-second handshake are marked Offline and the
//!    system continues without them

#![allow(dead_code)]

pub mod call;
pub mod cpu_info;
pub mod per_cpu;
pub mod startup;

#[cfg(target_os = "none")]
mod trampoline;

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub use cpu_info::{CpuFeatures, CpuInfo, CpuState};
pub use per_cpu::current_cpu_id;

use crate::MAX_CPUS;

// =============================================================================
// Error Type
// =============================================================================

/// SMP error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpError {
    /// SMP subsystem not initialized.
    NotInitialized,
    /// SMP subsystem already initialized.
    AlreadyInitialized,
    /// CPU id out of range or unregistered.
    InvalidCpuId,
    /// AP did not complete the handshake within the timeout.
    BringupTimeout,
    /// Trampoline page is not available.
    TrampolineNotReady,
    /// Per-CPU initialization failed.
    PerCpuInitFailed,
    /// No usable firmware processor description.
    FirmwareAbsent,
}

impl fmt::Display for SmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmpError::NotInitialized => write!(f, "SMP not initialized"),
            SmpError::AlreadyInitialized => write!(f, "SMP already initialized"),
            SmpError::InvalidCpuId => write!(f, "invalid CPU id"),
            SmpError::BringupTimeout => write!(f, "AP bring-up timeout"),
            SmpError::TrampolineNotReady => write!(f, "trampoline not ready"),
            SmpError::PerCpuInitFailed => write!(f, "per-CPU init failed"),
            SmpError::FirmwareAbsent => write!(f, "firmware topology absent"),
        }
    }
}

// =============================================================================
// Global State
// =============================================================================

/// Bitmask of online CPUs by logical id. Read lock-free everywhere;
/// written on the bring-up/offline paths only.
static CPU_ONLINE: AtomicU64 = AtomicU64::new(0);

/// Bitmask of CPUs participating in scheduling.
static CPU_ACTIVE: AtomicU64 = AtomicU64::new(0);

/// Number of online CPUs.
static ONLINE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Number of processors described by firmware (enabled or not).
static POSSIBLE_COUNT: AtomicU32 = AtomicU32::new(1);

/// Logical id of the bootstrap processor.
static BSP_CPU_ID: AtomicU32 = AtomicU32::new(0);

/// Current online mask.
#[inline]
pub fn online_mask() -> u64 {
    CPU_ONLINE.load(Ordering::Acquire)
}

/// Current active (schedulable) mask.
#[inline]
pub fn active_mask() -> u64 {
    CPU_ACTIVE.load(Ordering::Acquire)
}

/// Whether a CPU is online.
#[inline]
pub fn is_cpu_online(cpu_id: usize) -> bool {
    cpu_id < MAX_CPUS && online_mask() & (1 << cpu_id) != 0
}

/// Number of online CPUs.
#[inline]
pub fn cpu_count() -> u32 {
    ONLINE_COUNT.load(Ordering::Relaxed)
}

/// Number of firmware-described processors.
#[inline]
pub fn possible_cpu_count() -> u32 {
    POSSIBLE_COUNT.load(Ordering::Relaxed)
}

/// Publish the firmware-described processor count; boot path only.
pub fn set_possible_cpu_count(count: u32) {
    POSSIBLE_COUNT.store(count, Ordering::SeqCst);
}

/// The BSP's logical id.
#[inline]
pub fn bsp_cpu_id() -> u32 {
    BSP_CPU_ID.load(Ordering::Relaxed)
}

/// Publish the BSP's logical id; boot path only.
pub fn set_bsp_cpu_id(cpu_id: u32) {
    BSP_CPU_ID.store(cpu_id, Ordering::SeqCst);
}

/// Mark a CPU online or offline in both masks.
pub fn set_cpu_online(cpu_id: usize, online: bool) {
    if cpu_id >= MAX_CPUS {
        return;
    }
    let bit = 1u64 << cpu_id;
    if online {
        let prev = CPU_ONLINE.fetch_or(bit, Ordering::SeqCst);
        CPU_ACTIVE.fetch_or(bit, Ordering::SeqCst);
        if prev & bit == 0 {
            ONLINE_COUNT.fetch_add(1, Ordering::SeqCst);
        }
    } else {
        let prev = CPU_ONLINE.fetch_and(!bit, Ordering::SeqCst);
        CPU_ACTIVE.fetch_and(!bit, Ordering::SeqCst);
        if prev & bit != 0 {
            ONLINE_COUNT.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Invoke `f` for every online CPU id.
pub fn for_each_online_cpu<F: FnMut(usize)>(mut f: F) {
    let mask = online_mask();
    for cpu_id in 0..MAX_CPUS {
        if mask & (1 << cpu_id) != 0 {
            f(cpu_id);
        }
    }
}

#[cfg(test)]
pub(crate) fn reset_masks_for_tests() {
    CPU_ONLINE.store(0, Ordering::SeqCst);
    CPU_ACTIVE.store(0, Ordering::SeqCst);
    ONLINE_COUNT.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static MASK_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_online_mask_tracking() {
        let _guard = MASK_TEST_LOCK.lock().unwrap();
        reset_masks_for_tests();

        set_cpu_online(0, true);
        set_cpu_online(3, true);
        assert!(is_cpu_online(0));
        assert!(!is_cpu_online(1));
        assert!(is_cpu_online(3));
        assert_eq!(cpu_count(), 2);
        assert_eq!(online_mask(), 0b1001);

        // Double-online does not double-count.
        set_cpu_online(3, true);
        assert_eq!(cpu_count(), 2);

        set_cpu_online(3, false);
        assert_eq!(cpu_count(), 1);
        assert_eq!(online_mask(), 0b0001);
        reset_masks_for_tests();
    }

    #[test]
    fn test_for_each_online() {
        let _guard = MASK_TEST_LOCK.lock().unwrap();
        reset_masks_for_tests();
        set_cpu_online(1, true);
        set_cpu_online(2, true);
        let mut seen = std::vec::Vec::new();
        for_each_online_cpu(|cpu| seen.push(cpu));
        assert_eq!(seen, [1, 2]);
        reset_masks_for_tests();
    }
}
