//! # x86_64 APIC Framework
//!
//! Local APIC (xAPIC and x2APIC), I/O APIC routing, and inter-processor
//! interrupts. The two local-APIC modes differ only in how registers are
//! reached (memory-mapped loads/stores versus MSR accesses), so the
//! mode decision is made once at boot and confined to the register seam
//! in [`local`]; every caller above it is mode-agnostic.
//!
//! ## Vector Map
//!
//! | Vector | Use |
//! |--------|-----|
//! | 0xFF   | Spurious |
//! | 0xFE   | APIC error |
//! | 0xFD   | Reschedule IPI |
//! | 0xFC   | TLB shootdown IPI |
//! | 0xFB   | Stop/halt IPI |
//! | 0xFA   | Call-function IPI |
//! | 0x40   | Scheduler tick timer |
//! | 0x20+  | External (I/O APIC routed) interrupts |

#![allow(dead_code)]

pub mod ioapic;
pub mod ipi;
pub mod local;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub use ioapic::{DeliveryMode, IoApic, Polarity, RedirectionEntry, TriggerMode};
pub use ipi::IpiDestination;
pub use local::{ApicError, LocalApicMode, TimerDivide, TimerMode};

// =============================================================================
// Constants
// =============================================================================

/// Default Local APIC MMIO base address.
pub const LAPIC_BASE_DEFAULT: u64 = 0xFEE0_0000;

/// Spurious interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// APIC error vector.
pub const ERROR_VECTOR: u8 = 0xFE;

/// Reschedule IPI vector.
pub const RESCHEDULE_VECTOR: u8 = 0xFD;

/// TLB shootdown IPI vector.
pub const TLB_VECTOR: u8 = 0xFC;

/// Stop/halt IPI vector.
pub const STOP_VECTOR: u8 = 0xFB;

/// Call-function IPI vector.
pub const CALL_VECTOR: u8 = 0xFA;

/// Scheduler tick timer vector.
pub const TIMER_VECTOR: u8 = 0x40;

/// First vector used for external (I/O APIC routed) interrupts.
pub const EXTERNAL_VECTOR_BASE: u8 = 0x20;

// =============================================================================
// APIC State
// =============================================================================

static APIC_INITIALIZED: AtomicBool = AtomicBool::new(false);
static X2APIC_ENABLED: AtomicBool = AtomicBool::new(false);
static BSP_APIC_ID: AtomicU32 = AtomicU32::new(0);
static LAPIC_BASE: AtomicU64 = AtomicU64::new(LAPIC_BASE_DEFAULT);

/// Check whether the local APIC has been initialized on the BSP.
#[inline]
pub fn is_initialized() -> bool {
    APIC_INITIALIZED.load(Ordering::Acquire)
}

/// Check whether x2APIC (register-based) mode is active.
#[inline]
pub fn is_x2apic_enabled() -> bool {
    X2APIC_ENABLED.load(Ordering::Relaxed)
}

/// Current operating mode.
pub fn mode() -> LocalApicMode {
    if is_x2apic_enabled() {
        LocalApicMode::X2Apic
    } else {
        LocalApicMode::XApic
    }
}

/// The BSP's APIC id.
#[inline]
pub fn bsp_apic_id() -> u32 {
    BSP_APIC_ID.load(Ordering::Relaxed)
}

/// Check whether the current CPU is the BSP.
#[inline]
pub fn is_bsp() -> bool {
    local::read_self_id() == bsp_apic_id()
}

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the APIC subsystem on the BSP.
///
/// Detects x2APIC support, prefers it when present, programs the
/// spurious/error vectors, and calibrates the timer against the PIT.
///
/// # Safety
///
/// Must be called exactly once during early boot on the BSP, before
/// interrupts are enabled.
pub unsafe fn init(mmio_base: Option<u64>) -> Result<(), ApicError> {
    if APIC_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(ApicError::AlreadyInitialized);
    }

    if !local::is_apic_present() {
        APIC_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(ApicError::NotPresent);
    }

    if local::is_x2apic_supported() {
        if unsafe { local::enable_x2apic() } {
            X2APIC_ENABLED.store(true, Ordering::SeqCst);
            log::info!("APIC: x2APIC mode enabled");
        } else {
            log::warn!("APIC: x2APIC supported but enable failed, using xAPIC");
        }
    }

    let base = mmio_base.unwrap_or_else(local::read_base_msr);
    LAPIC_BASE.store(base, Ordering::SeqCst);

    unsafe { local::init(base)? };

    let bsp_id = local::read_self_id();
    BSP_APIC_ID.store(bsp_id, Ordering::SeqCst);

    local::calibrate_timer();

    log::info!(
        "APIC: initialized (BSP id={}, base={:#x}, mode={:?})",
        bsp_id,
        base,
        mode()
    );

    Ok(())
}

/// Initialize the local APIC of an application processor.
///
/// Reuses the mode decision and timer calibration done on the BSP and
/// starts the periodic scheduler tick.
///
/// # Safety
///
/// Must run on the AP being brought up, after [`init`] completed on the
/// BSP.
pub unsafe fn init_for_ap() -> Result<(), ApicError> {
    if !is_initialized() {
        return Err(ApicError::NotInitialized);
    }

    let base = LAPIC_BASE.load(Ordering::Acquire);
    unsafe { local::init(base)? };
    local::start_periodic_tick();

    log::debug!("APIC: AP {} initialized", local::read_self_id());
    Ok(())
}

/// Signal end-of-interrupt for the vector in service.
#[inline]
pub fn eoi() {
    local::eoi();
}

// =============================================================================
// Register Offsets
// =============================================================================

/// Local APIC register offsets (xAPIC memory-mapped access).
pub mod registers {
    /// APIC ID Register.
    pub const ID: u32 = 0x020;
    /// APIC Version Register.
    pub const VERSION: u32 = 0x030;
    /// Task Priority Register.
    pub const TPR: u32 = 0x080;
    /// Processor Priority Register.
    pub const PPR: u32 = 0x0A0;
    /// End Of Interrupt Register.
    pub const EOI: u32 = 0x0B0;
    /// Logical Destination Register.
    pub const LDR: u32 = 0x0D0;
    /// Destination Format Register.
    pub const DFR: u32 = 0x0E0;
    /// Spurious Interrupt Vector Register.
    pub const SVR: u32 = 0x0F0;
    /// In-Service Register base (8 registers).
    pub const ISR_BASE: u32 = 0x100;
    /// Interrupt Request Register base (8 registers).
    pub const IRR_BASE: u32 = 0x200;
    /// Error Status Register.
    pub const ESR: u32 = 0x280;
    /// Interrupt Command Register (low).
    pub const ICR_LOW: u32 = 0x300;
    /// Interrupt Command Register (high).
    pub const ICR_HIGH: u32 = 0x310;
    /// LVT Timer Register.
    pub const LVT_TIMER: u32 = 0x320;
    /// LVT Thermal Sensor Register.
    pub const LVT_THERMAL: u32 = 0x330;
    /// LVT Performance Counter Register.
    pub const LVT_PERF: u32 = 0x340;
    /// LVT LINT0 Register.
    pub const LVT_LINT0: u32 = 0x350;
    /// LVT LINT1 Register.
    pub const LVT_LINT1: u32 = 0x360;
    /// LVT Error Register.
    pub const LVT_ERROR: u32 = 0x370;
    /// Timer Initial Count Register.
    pub const TIMER_ICR: u32 = 0x380;
    /// Timer Current Count Register.
    pub const TIMER_CCR: u32 = 0x390;
    /// Timer Divide Configuration Register.
    pub const TIMER_DCR: u32 = 0x3E0;
}

/// x2APIC MSR numbers.
pub mod x2apic_msr {
    /// Base MSR for x2APIC registers; xAPIC offset >> 4 is added.
    pub const BASE: u32 = 0x800;
    /// APIC ID register MSR.
    pub const ID: u32 = BASE + 0x02;
    /// End-of-interrupt register MSR.
    pub const EOI: u32 = BASE + 0x0B;
    /// Spurious interrupt vector register MSR.
    pub const SVR: u32 = BASE + 0x0F;
    /// Interrupt command register MSR (single 64-bit register).
    pub const ICR: u32 = BASE + 0x30;
    /// LVT timer register MSR.
    pub const LVT_TIMER: u32 = BASE + 0x32;
    /// Timer initial count register MSR.
    pub const TIMER_ICR: u32 = BASE + 0x38;
    /// Timer current count register MSR.
    pub const TIMER_CCR: u32 = BASE + 0x39;
    /// Timer divide configuration register MSR.
    pub const TIMER_DCR: u32 = BASE + 0x3E;
}

// =============================================================================
// Compile-time Assertions
// =============================================================================

const _: () = {
    // xAPIC registers are 16-byte aligned; the x2APIC MSR mapping
    // (offset >> 4) relies on it.
    assert!(registers::ID % 16 == 0);
    assert!(registers::EOI % 16 == 0);
    assert!(registers::ICR_LOW % 16 == 0);
    assert!(registers::TIMER_DCR % 16 == 0);
};
