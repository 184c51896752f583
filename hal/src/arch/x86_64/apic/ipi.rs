//! # Inter-Processor Interrupts
//!
//! Cross-CPU signaling through the local APIC's interrupt command
//! register. Fixed IPIs carry a vector; INIT and STARTUP drive the AP
//! bring-up protocol and have wait-for-delivery semantics in xAPIC mode
//! (the x2APIC ICR has no delivery-status bit to poll).

use core::sync::atomic::{AtomicU64, Ordering};

use super::{CALL_VECTOR, RESCHEDULE_VECTOR, STOP_VECTOR, TLB_VECTOR};

// =============================================================================
// Destination & Delivery
// =============================================================================

/// IPI destination specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiDestination {
    /// A specific APIC id.
    Single(u32),
    /// The sending CPU itself.
    Myself,
    /// Every CPU including the sender.
    AllIncludingSelf,
    /// Every CPU except the sender.
    AllExcludingSelf,
}

impl IpiDestination {
    /// ICR destination-shorthand field.
    #[inline]
    pub fn shorthand(&self) -> u8 {
        match self {
            IpiDestination::Single(_) => 0b00,
            IpiDestination::Myself => 0b01,
            IpiDestination::AllIncludingSelf => 0b10,
            IpiDestination::AllExcludingSelf => 0b11,
        }
    }

    /// Destination APIC id (0 when a shorthand addresses the target).
    #[inline]
    pub fn apic_id(&self) -> u32 {
        match self {
            IpiDestination::Single(id) => *id,
            _ => 0,
        }
    }
}

/// IPI delivery mode (ICR bits 8-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Fixed interrupt with vector.
    Fixed = 0b000,
    /// Non-maskable interrupt.
    Nmi = 0b100,
    /// INIT signal.
    Init = 0b101,
    /// Startup IPI; the vector encodes the entry page.
    Startup = 0b110,
}

/// Level field for INIT assert/de-assert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// De-assert (xAPIC INIT sequence only).
    Deassert,
    /// Assert.
    Assert,
}

// =============================================================================
// Statistics
// =============================================================================

static IPI_SENT: AtomicU64 = AtomicU64::new(0);
static IPI_RECEIVED: AtomicU64 = AtomicU64::new(0);

/// Total IPIs sent from this CPU's point of view.
#[inline]
pub fn sent_count() -> u64 {
    IPI_SENT.load(Ordering::Relaxed)
}

/// Total IPIs acknowledged by handlers.
#[inline]
pub fn received_count() -> u64 {
    IPI_RECEIVED.load(Ordering::Relaxed)
}

/// Record an IPI arrival; called from the handlers.
#[inline]
pub fn note_received() {
    IPI_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

// =============================================================================
// ICR Encoding
// =============================================================================

/// Build the low 32 ICR bits (xAPIC) for a physical-destination IPI.
pub(crate) fn build_icr_low(
    vector: u8,
    delivery: DeliveryMode,
    level: Level,
    level_triggered: bool,
    shorthand: u8,
) -> u32 {
    let mut icr = vector as u32;
    icr |= (delivery as u32) << 8;
    if level == Level::Assert {
        icr |= 1 << 14;
    }
    if level_triggered {
        icr |= 1 << 15;
    }
    icr |= (shorthand as u32) << 18;
    icr
}

/// Build the single 64-bit x2APIC ICR value.
pub(crate) fn build_icr_x2apic(
    dest: u32,
    vector: u8,
    delivery: DeliveryMode,
    level: Level,
    level_triggered: bool,
    shorthand: u8,
) -> u64 {
    ((dest as u64) << 32)
        | build_icr_low(vector, delivery, level, level_triggered, shorthand) as u64
}

// =============================================================================
// Raw Send
// =============================================================================

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        use super::{is_x2apic_enabled, local, registers};

        unsafe fn send_raw(
            dest: IpiDestination,
            vector: u8,
            delivery: DeliveryMode,
            level: Level,
            level_triggered: bool,
        ) {
            let shorthand = dest.shorthand();
            if is_x2apic_enabled() {
                let icr = build_icr_x2apic(
                    dest.apic_id(),
                    vector,
                    delivery,
                    level,
                    level_triggered,
                    shorthand,
                );
                unsafe { local::write_icr_x2apic(icr) };
            } else {
                unsafe {
                    wait_delivery_idle();
                    if shorthand == 0 {
                        local::write_lapic(registers::ICR_HIGH, dest.apic_id() << 24);
                    }
                    local::write_lapic(
                        registers::ICR_LOW,
                        build_icr_low(vector, delivery, level, level_triggered, shorthand),
                    );
                }
            }
            IPI_SENT.fetch_add(1, Ordering::Relaxed);
        }

        /// Poll the xAPIC delivery-status bit until the previous IPI
        /// left the ICR.
        unsafe fn wait_delivery_idle() {
            while unsafe { local::read_lapic(registers::ICR_LOW) } & (1 << 12) != 0 {
                core::hint::spin_loop();
            }
        }
    } else {
        // Host builds account for sends without touching hardware so
        // the scheduler's IPI decisions stay observable in tests.
        unsafe fn send_raw(
            _dest: IpiDestination,
            _vector: u8,
            _delivery: DeliveryMode,
            _level: Level,
            _level_triggered: bool,
        ) {
            IPI_SENT.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Public Interface
// =============================================================================

/// Send a fixed IPI with the given vector.
pub fn send(dest: IpiDestination, vector: u8) {
    unsafe { send_raw(dest, vector, DeliveryMode::Fixed, Level::Assert, false) };
}

/// Broadcast a fixed IPI to every other CPU.
pub fn send_all_excluding_self(vector: u8) {
    send(IpiDestination::AllExcludingSelf, vector);
}

/// Send an NMI.
pub fn send_nmi(dest: IpiDestination) {
    unsafe { send_raw(dest, 0, DeliveryMode::Nmi, Level::Assert, false) };
}

/// Send the INIT IPI to an AP being brought up.
///
/// In xAPIC mode the level-triggered assert is followed by a de-assert,
/// with delivery awaited between the two, as the bring-up sequence
/// requires.
pub fn send_init(apic_id: u32) {
    let dest = IpiDestination::Single(apic_id);
    unsafe {
        send_raw(dest, 0, DeliveryMode::Init, Level::Assert, true);
        if !super::is_x2apic_enabled() {
            send_raw(dest, 0, DeliveryMode::Init, Level::Deassert, true);
        }
    }
}

/// Send a STARTUP IPI; `trampoline_page` is the physical entry address
/// divided by 4096 and must lie below 1 MiB.
pub fn send_startup(apic_id: u32, trampoline_page: u8) {
    unsafe {
        send_raw(
            IpiDestination::Single(apic_id),
            trampoline_page,
            DeliveryMode::Startup,
            Level::Assert,
            false,
        );
    }
}

/// Trigger a reschedule pass on another CPU.
#[inline]
pub fn send_reschedule(apic_id: u32) {
    send(IpiDestination::Single(apic_id), RESCHEDULE_VECTOR);
}

/// Request a TLB flush on another CPU.
#[inline]
pub fn send_tlb_flush(apic_id: u32) {
    send(IpiDestination::Single(apic_id), TLB_VECTOR);
}

/// Request a cross-CPU function call on another CPU.
#[inline]
pub fn send_call_function(apic_id: u32) {
    send(IpiDestination::Single(apic_id), CALL_VECTOR);
}

/// Emergency-stop every other CPU.
#[inline]
pub fn broadcast_stop() {
    send_all_excluding_self(STOP_VECTOR);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icr_low_fixed() {
        let icr = build_icr_low(0xFD, DeliveryMode::Fixed, Level::Assert, false, 0b00);
        assert_eq!(icr & 0xFF, 0xFD);
        assert_eq!((icr >> 8) & 0x7, 0); // fixed delivery
        assert_ne!(icr & (1 << 14), 0); // assert
        assert_eq!(icr & (1 << 15), 0); // edge
        assert_eq!((icr >> 18) & 0x3, 0); // no shorthand
    }

    #[test]
    fn test_icr_low_init_deassert() {
        let icr = build_icr_low(0, DeliveryMode::Init, Level::Deassert, true, 0b00);
        assert_eq!((icr >> 8) & 0x7, 0b101);
        assert_eq!(icr & (1 << 14), 0); // de-assert
        assert_ne!(icr & (1 << 15), 0); // level
    }

    #[test]
    fn test_icr_low_startup_vector_is_page() {
        let icr = build_icr_low(0x08, DeliveryMode::Startup, Level::Assert, false, 0b00);
        assert_eq!(icr & 0xFF, 0x08);
        assert_eq!((icr >> 8) & 0x7, 0b110);
    }

    #[test]
    fn test_icr_x2apic_destination() {
        let icr = build_icr_x2apic(7, 0xFD, DeliveryMode::Fixed, Level::Assert, false, 0b00);
        assert_eq!(icr >> 32, 7);
        assert_eq!(icr as u32 & 0xFF, 0xFD);
    }

    #[test]
    fn test_shorthand_encoding() {
        assert_eq!(IpiDestination::Single(3).shorthand(), 0b00);
        assert_eq!(IpiDestination::Myself.shorthand(), 0b01);
        assert_eq!(IpiDestination::AllIncludingSelf.shorthand(), 0b10);
        assert_eq!(IpiDestination::AllExcludingSelf.shorthand(), 0b11);
        let icr = build_icr_low(0xFB, DeliveryMode::Fixed, Level::Assert, false, 0b11);
        assert_eq!((icr >> 18) & 0x3, 0b11);
    }

    #[test]
    fn test_send_counts() {
        // Other tests in this binary may send concurrently; the counter
        // must advance by at least our two sends.
        let before = sent_count();
        send_reschedule(1);
        send_all_excluding_self(RESCHEDULE_VECTOR);
        assert!(sent_count() >= before + 2);
    }
}
