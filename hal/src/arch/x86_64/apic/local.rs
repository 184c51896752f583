//! # Local APIC
//!
//! Register access seam for both local-APIC modes plus the per-CPU
//! timer. xAPIC reaches registers through the memory-mapped window at
//! the APIC base; x2APIC reaches the same registers as MSRs at
//! `0x800 + (offset >> 4)`. The contract of every operation is identical
//! in both modes; only [`read_lapic`]/[`write_lapic`] and the ICR path
//! differ.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{is_x2apic_enabled, registers, ERROR_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::arch::x86_64::timers::pit;

// =============================================================================
// Error Type
// =============================================================================

/// APIC error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicError {
    /// No local APIC on this processor.
    NotPresent,
    /// APIC subsystem already initialized.
    AlreadyInitialized,
    /// APIC subsystem not initialized yet.
    NotInitialized,
    /// IPI could not be delivered.
    IpiDeliveryFailed,
    /// Timer configuration error.
    TimerError,
    /// I/O APIC error.
    IoApicError,
}

impl fmt::Display for ApicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApicError::NotPresent => write!(f, "APIC not present"),
            ApicError::AlreadyInitialized => write!(f, "APIC already initialized"),
            ApicError::NotInitialized => write!(f, "APIC not initialized"),
            ApicError::IpiDeliveryFailed => write!(f, "IPI delivery failed"),
            ApicError::TimerError => write!(f, "timer configuration error"),
            ApicError::IoApicError => write!(f, "I/O APIC error"),
        }
    }
}

// =============================================================================
// Operating Mode
// =============================================================================

/// Local APIC operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalApicMode {
    /// Memory-mapped register access.
    XApic,
    /// MSR-based register access.
    X2Apic,
}

/// APIC timer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once.
    OneShot,
    /// Fire at a fixed period.
    Periodic,
}

/// APIC timer divide configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimerDivide {
    /// Divide by 1.
    By1 = 0b1011,
    /// Divide by 2.
    By2 = 0b0000,
    /// Divide by 4.
    By4 = 0b0001,
    /// Divide by 8.
    By8 = 0b0010,
    /// Divide by 16.
    By16 = 0b0011,
    /// Divide by 32.
    By32 = 0b1000,
    /// Divide by 64.
    By64 = 0b1001,
    /// Divide by 128.
    By128 = 0b1010,
}

// =============================================================================
// CPUID Probes
// =============================================================================

/// Check CPUID.01H:EDX.APIC\[bit 9\].
pub fn is_apic_present() -> bool {
    let (_, _, _, edx) = cpuid(1);
    edx & (1 << 9) != 0
}

/// Check CPUID.01H:ECX.x2APIC\[bit 21\].
pub fn is_x2apic_supported() -> bool {
    let (_, _, ecx, _) = cpuid(1);
    ecx & (1 << 21) != 0
}

pub(crate) fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    cpuid_subleaf(leaf, 0)
}

pub(crate) fn cpuid_subleaf(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    let (mut eax, ebx, mut ecx, edx): (u32, u32, u32, u32);
    eax = leaf;
    ecx = subleaf;
    unsafe {
        core::arch::asm!(
            "mov {tmp:r}, rbx",
            "cpuid",
            "xchg {tmp:r}, rbx",
            tmp = out(reg) ebx,
            inout("eax") eax,
            inout("ecx") ecx,
            out("edx") edx,
            options(nostack, preserves_flags),
        );
    }
    (eax, ebx, ecx, edx)
}

// =============================================================================
// Register Access Seam
// =============================================================================

/// Virtual base for xAPIC memory-mapped registers.
static LAPIC_VIRT_BASE: AtomicU64 = AtomicU64::new(super::LAPIC_BASE_DEFAULT);

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        use super::x2apic_msr;

        #[inline]
        unsafe fn read_msr(msr: u32) -> u64 {
            let (low, high): (u32, u32);
            unsafe {
                core::arch::asm!(
                    "rdmsr",
                    in("ecx") msr,
                    out("eax") low,
                    out("edx") high,
                    options(nostack, preserves_flags),
                );
            }
            ((high as u64) << 32) | (low as u64)
        }

        #[inline]
        unsafe fn write_msr(msr: u32, value: u64) {
            unsafe {
                core::arch::asm!(
                    "wrmsr",
                    in("ecx") msr,
                    in("eax") value as u32,
                    in("edx") (value >> 32) as u32,
                    options(nostack, preserves_flags),
                );
            }
        }

        #[inline]
        unsafe fn read_xapic(offset: u32) -> u32 {
            let addr = LAPIC_VIRT_BASE.load(Ordering::Relaxed) + offset as u64;
            unsafe { core::ptr::read_volatile(addr as *const u32) }
        }

        #[inline]
        unsafe fn write_xapic(offset: u32, value: u32) {
            let addr = LAPIC_VIRT_BASE.load(Ordering::Relaxed) + offset as u64;
            unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
        }

        /// Read a local APIC register in the active mode.
        ///
        /// # Safety
        ///
        /// The APIC must be mapped/enabled and `offset` must be a valid
        /// register offset.
        #[inline]
        pub unsafe fn read_lapic(offset: u32) -> u32 {
            if is_x2apic_enabled() {
                unsafe { read_msr(x2apic_msr::BASE + (offset >> 4)) as u32 }
            } else {
                unsafe { read_xapic(offset) }
            }
        }

        /// Write a local APIC register in the active mode.
        ///
        /// # Safety
        ///
        /// As [`read_lapic`]; invalid values have undefined hardware
        /// effects.
        #[inline]
        pub unsafe fn write_lapic(offset: u32, value: u32) {
            if is_x2apic_enabled() {
                unsafe { write_msr(x2apic_msr::BASE + (offset >> 4), value as u64) }
            } else {
                unsafe { write_xapic(offset, value) }
            }
        }

        /// Write the 64-bit x2APIC ICR.
        ///
        /// # Safety
        ///
        /// x2APIC mode must be active.
        #[inline]
        pub(super) unsafe fn write_icr_x2apic(value: u64) {
            unsafe { write_msr(x2apic_msr::ICR, value) }
        }

        /// Read IA32_APIC_BASE.
        pub fn read_base_msr() -> u64 {
            const IA32_APIC_BASE: u32 = 0x1B;
            unsafe { read_msr(IA32_APIC_BASE) & 0xFFFF_FFFF_FFFF_F000 }
        }

        /// Enable x2APIC mode via IA32_APIC_BASE; returns whether the
        /// enable stuck.
        ///
        /// # Safety
        ///
        /// Must run before any other APIC register access on this CPU.
        pub unsafe fn enable_x2apic() -> bool {
            const IA32_APIC_BASE: u32 = 0x1B;
            const APIC_ENABLE: u64 = 1 << 11;
            const X2APIC_ENABLE: u64 = 1 << 10;

            unsafe {
                let value = read_msr(IA32_APIC_BASE);
                write_msr(IA32_APIC_BASE, value | APIC_ENABLE | X2APIC_ENABLE);
                read_msr(IA32_APIC_BASE) & X2APIC_ENABLE != 0
            }
        }

        /// Current processor's hardware APIC id.
        #[inline]
        pub fn read_self_id() -> u32 {
            unsafe {
                if is_x2apic_enabled() {
                    read_msr(x2apic_msr::ID) as u32
                } else {
                    (read_xapic(registers::ID) >> 24) & 0xFF
                }
            }
        }
    } else {
        /// Host stub; there is no APIC window to read.
        ///
        /// # Safety
        ///
        /// Always safe off-metal.
        #[inline]
        pub unsafe fn read_lapic(_offset: u32) -> u32 {
            0
        }

        /// Host stub.
        ///
        /// # Safety
        ///
        /// Always safe off-metal.
        #[inline]
        pub unsafe fn write_lapic(_offset: u32, _value: u32) {}

        #[inline]
        pub(super) unsafe fn write_icr_x2apic(_value: u64) {}

        /// Host stub; reports the architectural default base.
        pub fn read_base_msr() -> u64 {
            super::LAPIC_BASE_DEFAULT
        }

        /// Host stub; x2APIC cannot be enabled off-metal.
        ///
        /// # Safety
        ///
        /// Always safe off-metal.
        pub unsafe fn enable_x2apic() -> bool {
            false
        }

        /// Current processor's hardware APIC id, from CPUID (the
        /// bootstrap path also uses this before the APIC is mapped).
        #[inline]
        pub fn read_self_id() -> u32 {
            let (_, ebx, _, _) = cpuid(1);
            ebx >> 24
        }
    }
}

// =============================================================================
// Initialization
// =============================================================================

/// Program the local APIC of the calling CPU: spurious and error
/// vectors, TPR 0 (accept everything), masked LVTs, flat logical
/// destination in xAPIC mode.
///
/// # Safety
///
/// Must run with interrupts disabled on the CPU being initialized.
pub unsafe fn init(base: u64) -> Result<(), ApicError> {
    LAPIC_VIRT_BASE.store(base, Ordering::SeqCst);

    unsafe {
        // Enable via SVR with the spurious vector.
        let svr = read_lapic(registers::SVR);
        write_lapic(
            registers::SVR,
            (svr & 0xFFFF_FF00) | (SPURIOUS_VECTOR as u32) | (1 << 8),
        );

        // Accept all interrupt priorities.
        write_lapic(registers::TPR, 0);

        // Route errors, mask everything else until configured.
        write_lapic(registers::LVT_ERROR, ERROR_VECTOR as u32);
        write_lapic(registers::LVT_TIMER, 1 << 16);
        write_lapic(registers::LVT_LINT0, 1 << 16);
        write_lapic(registers::LVT_LINT1, 1 << 16);
        write_lapic(registers::LVT_THERMAL, 1 << 16);
        write_lapic(registers::LVT_PERF, 1 << 16);

        // Clear sticky error state (write arms, second write reads back).
        write_lapic(registers::ESR, 0);
        write_lapic(registers::ESR, 0);

        if !is_x2apic_enabled() {
            // Flat model; logical id mirrors the physical id.
            write_lapic(registers::DFR, 0xFFFF_FFFF);
            let id = read_lapic(registers::ID) >> 24;
            write_lapic(registers::LDR, id << 24);
        }
    }

    Ok(())
}

/// Signal end-of-interrupt.
#[inline]
pub fn eoi() {
    unsafe {
        write_lapic(registers::EOI, 0);
    }
}

/// Set the task priority register.
#[inline]
pub fn set_tpr(priority: u8) {
    unsafe {
        write_lapic(registers::TPR, priority as u32);
    }
}

// =============================================================================
// Timer
// =============================================================================

/// Scheduler tick frequency (Hz). One tick per millisecond keeps the
/// slice accounting in milliseconds exact.
pub const TICK_HZ: u32 = 1000;

/// Calibrated APIC-timer ticks per millisecond (at divide-by-16).
static TIMER_TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

/// Calibrated APIC-timer ticks per millisecond; 0 before calibration.
pub fn timer_ticks_per_ms() -> u32 {
    TIMER_TICKS_PER_MS.load(Ordering::Relaxed)
}

/// Calibrate the APIC timer against the PIT.
///
/// Runs the timer one-shot from full count over a 10 ms PIT wait and
/// derives ticks-per-millisecond. Returns the derived rate.
pub fn calibrate_timer() -> u32 {
    const CALIBRATION_MS: u32 = 10;

    unsafe {
        write_lapic(registers::TIMER_DCR, TimerDivide::By16 as u32);
        // Masked one-shot; only the counter matters here.
        write_lapic(registers::LVT_TIMER, 1 << 16);
        write_lapic(registers::TIMER_ICR, u32::MAX);
    }

    pit::wait_ms(CALIBRATION_MS);

    let remaining = unsafe { read_lapic(registers::TIMER_CCR) };
    let ticks_per_ms = (u32::MAX - remaining) / CALIBRATION_MS;
    TIMER_TICKS_PER_MS.store(ticks_per_ms, Ordering::SeqCst);

    log::info!("APIC: timer calibrated, {} ticks/ms", ticks_per_ms);
    ticks_per_ms
}

/// Start the periodic scheduler tick on the calling CPU at [`TICK_HZ`].
pub fn start_periodic_tick() {
    let per_tick = timer_ticks_per_ms() * (1000 / TICK_HZ).max(1);
    unsafe {
        write_lapic(registers::TIMER_DCR, TimerDivide::By16 as u32);
        write_lapic(
            registers::LVT_TIMER,
            (TIMER_VECTOR as u32) | (1 << 17), // periodic
        );
        write_lapic(registers::TIMER_ICR, per_tick.max(1));
    }
}

/// Arm a one-shot timer expiring after `us` microseconds.
pub fn arm_oneshot(us: u64) {
    let ticks = (us * timer_ticks_per_ms() as u64) / 1000;
    unsafe {
        write_lapic(registers::TIMER_DCR, TimerDivide::By16 as u32);
        write_lapic(registers::LVT_TIMER, TIMER_VECTOR as u32); // one-shot
        write_lapic(registers::TIMER_ICR, (ticks as u32).max(1));
    }
}

/// Stop the local timer.
pub fn stop_timer() {
    unsafe {
        write_lapic(registers::LVT_TIMER, 1 << 16);
        write_lapic(registers::TIMER_ICR, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::apic::x2apic_msr;

    #[test]
    fn test_cpuid_probes() {
        // Any x86_64 host has an APIC flag; the call itself must not
        // fault and the tuple must be coherent.
        let present = is_apic_present();
        let _ = is_x2apic_supported();
        assert!(present);
    }

    #[test]
    fn test_mode_msr_mapping() {
        // x2APIC MSR = 0x800 + (xAPIC offset >> 4).
        assert_eq!(x2apic_msr::BASE + (registers::EOI >> 4), x2apic_msr::EOI);
        assert_eq!(x2apic_msr::BASE + (registers::ID >> 4), x2apic_msr::ID);
        assert_eq!(
            x2apic_msr::BASE + (registers::TIMER_ICR >> 4),
            x2apic_msr::TIMER_ICR
        );
    }

    #[test]
    fn test_divide_encoding() {
        assert_eq!(TimerDivide::By1 as u32, 0b1011);
        assert_eq!(TimerDivide::By16 as u32, 0b0011);
        assert_eq!(TimerDivide::By128 as u32, 0b1010);
    }
}
