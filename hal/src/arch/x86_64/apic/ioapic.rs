//! # I/O APIC
//!
//! External interrupt routing. Each I/O APIC owns a window of global
//! system interrupts starting at its GSI base; a redirection entry per
//! line selects vector, destination CPU, polarity, trigger mode, and
//! mask. Firmware-supplied source overrides translate legacy bus-
//! relative interrupt numbers to routed GSIs.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use arrayvec::ArrayVec;

use super::local::ApicError;
use crate::firmware::SourceOverride;
use crate::sync::TicketLock;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of I/O APICs.
pub const MAX_IOAPICS: usize = 8;

/// Register select offset.
const IOREGSEL: u64 = 0x00;
/// Data window offset.
const IOWIN: u64 = 0x10;

/// Indirect register: id.
const REG_ID: u32 = 0x00;
/// Indirect register: version and redirection count.
const REG_VERSION: u32 = 0x01;
/// Indirect register: first redirection entry.
const REG_REDIR_BASE: u32 = 0x10;

// =============================================================================
// Redirection Entry
// =============================================================================

/// Interrupt delivery mode for routed interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Deliver to the destination's vector.
    Fixed = 0b000,
    /// Deliver to the lowest-priority CPU in the destination set.
    LowestPriority = 0b001,
    /// Non-maskable interrupt.
    Nmi = 0b100,
}

/// Line polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Active high (ISA default).
    ActiveHigh,
    /// Active low (PCI default).
    ActiveLow,
}

/// Trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Edge triggered (ISA default).
    Edge,
    /// Level triggered.
    Level,
}

/// One 64-bit redirection table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RedirectionEntry(u64);

impl RedirectionEntry {
    /// A masked entry with no routing.
    pub const MASKED: Self = Self(1 << 16);

    /// Build an unmasked physical-destination entry.
    pub fn new(
        vector: u8,
        delivery: DeliveryMode,
        polarity: Polarity,
        trigger: TriggerMode,
        dest_apic_id: u8,
    ) -> Self {
        let mut bits = vector as u64;
        bits |= (delivery as u64) << 8;
        if polarity == Polarity::ActiveLow {
            bits |= 1 << 13;
        }
        if trigger == TriggerMode::Level {
            bits |= 1 << 15;
        }
        bits |= (dest_apic_id as u64) << 56;
        Self(bits)
    }

    /// Raw 64-bit value.
    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Entry from a raw value.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Routed vector.
    #[inline]
    pub fn vector(&self) -> u8 {
        self.0 as u8
    }

    /// Destination APIC id.
    #[inline]
    pub fn destination(&self) -> u8 {
        (self.0 >> 56) as u8
    }

    /// Whether the line is masked.
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.0 & (1 << 16) != 0
    }

    /// Set or clear the mask bit.
    #[inline]
    pub fn set_masked(&mut self, masked: bool) {
        if masked {
            self.0 |= 1 << 16;
        } else {
            self.0 &= !(1 << 16);
        }
    }

    /// Line polarity.
    pub fn polarity(&self) -> Polarity {
        if self.0 & (1 << 13) != 0 {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        }
    }

    /// Trigger mode.
    pub fn trigger_mode(&self) -> TriggerMode {
        if self.0 & (1 << 15) != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }
}

// =============================================================================
// I/O APIC Registry
// =============================================================================

/// One registered I/O APIC.
struct IoApicState {
    /// Virtual MMIO base; 0 = slot unused.
    base: AtomicU64,
    /// First GSI handled by this controller.
    gsi_base: AtomicU32,
    /// Number of redirection entries.
    entries: AtomicU8,
}

impl IoApicState {
    const fn new() -> Self {
        Self {
            base: AtomicU64::new(0),
            gsi_base: AtomicU32::new(0),
            entries: AtomicU8::new(0),
        }
    }
}

static IOAPICS: [IoApicState; MAX_IOAPICS] = [const { IoApicState::new() }; MAX_IOAPICS];
static IOAPIC_COUNT: AtomicU8 = AtomicU8::new(0);

/// Firmware interrupt source overrides, installed once at boot.
static OVERRIDES: TicketLock<ArrayVec<SourceOverride, 16>> = TicketLock::new(ArrayVec::new_const());

/// Handle to one registered I/O APIC.
#[derive(Debug, Clone, Copy)]
pub struct IoApic {
    base: u64,
    gsi_base: u32,
    entries: u8,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        unsafe fn reg_read(base: u64, reg: u32) -> u32 {
            unsafe {
                core::ptr::write_volatile((base + IOREGSEL) as *mut u32, reg);
                core::ptr::read_volatile((base + IOWIN) as *const u32)
            }
        }

        unsafe fn reg_write(base: u64, reg: u32, value: u32) {
            unsafe {
                core::ptr::write_volatile((base + IOREGSEL) as *mut u32, reg);
                core::ptr::write_volatile((base + IOWIN) as *mut u32, value);
            }
        }
    } else {
        unsafe fn reg_read(_base: u64, reg: u32) -> u32 {
            // Report a 24-entry controller so registration logic is
            // exercisable off-metal.
            if reg == REG_VERSION { 23 << 16 } else { 0 }
        }

        unsafe fn reg_write(_base: u64, _reg: u32, _value: u32) {}
    }
}

/// Register an I/O APIC and mask all of its lines.
///
/// # Safety
///
/// `base` must be a valid mapping of the controller's registers.
pub unsafe fn register(base: u64, gsi_base: u32) -> Result<(), ApicError> {
    let index = IOAPIC_COUNT.load(Ordering::Acquire) as usize;
    if index >= MAX_IOAPICS {
        return Err(ApicError::IoApicError);
    }

    let version = unsafe { reg_read(base, REG_VERSION) };
    let entries = ((version >> 16) & 0xFF) as u8 + 1;

    let slot = &IOAPICS[index];
    slot.base.store(base, Ordering::SeqCst);
    slot.gsi_base.store(gsi_base, Ordering::SeqCst);
    slot.entries.store(entries, Ordering::SeqCst);
    IOAPIC_COUNT.store(index as u8 + 1, Ordering::Release);

    let ioapic = IoApic {
        base,
        gsi_base,
        entries,
    };
    ioapic.mask_all();

    let id = (unsafe { reg_read(base, REG_ID) } >> 24) & 0xF;
    log::info!(
        "IOAPIC: id {} registered, GSI base {}, {} entries",
        id,
        gsi_base,
        entries
    );

    Ok(())
}

/// Install the firmware interrupt source overrides.
pub fn set_overrides(overrides: &[SourceOverride]) {
    let mut table = OVERRIDES.lock();
    table.clear();
    for ovr in overrides.iter().take(table.capacity()) {
        log::debug!(
            "IOAPIC: override bus {} source {} -> GSI {} (flags {:#x})",
            ovr.bus,
            ovr.source,
            ovr.gsi,
            ovr.flags
        );
        table.push(*ovr);
    }
}

/// Translate a bus-relative source number to its routed GSI, applying
/// overrides. Identity for sources without an override.
pub fn source_to_gsi(source: u8) -> (u32, Option<SourceOverride>) {
    let table = OVERRIDES.lock();
    for ovr in table.iter() {
        if ovr.bus == 0 && ovr.source == source {
            return (ovr.gsi, Some(*ovr));
        }
    }
    (source as u32, None)
}

/// Number of registered I/O APICs.
pub fn count() -> u8 {
    IOAPIC_COUNT.load(Ordering::Acquire)
}

/// Look up the controller serving a GSI.
pub fn for_gsi(gsi: u32) -> Option<IoApic> {
    let count = count() as usize;
    for slot in IOAPICS.iter().take(count) {
        let base = slot.base.load(Ordering::Acquire);
        if base == 0 {
            continue;
        }
        let gsi_base = slot.gsi_base.load(Ordering::Relaxed);
        let entries = slot.entries.load(Ordering::Relaxed);
        if gsi >= gsi_base && gsi < gsi_base + entries as u32 {
            return Some(IoApic {
                base,
                gsi_base,
                entries,
            });
        }
    }
    None
}

impl IoApic {
    /// First GSI handled by this controller.
    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    /// Number of redirection entries.
    pub fn entries(&self) -> u8 {
        self.entries
    }

    /// Read a redirection entry.
    pub fn read_entry(&self, index: u8) -> Option<RedirectionEntry> {
        if index >= self.entries {
            return None;
        }
        let reg = REG_REDIR_BASE + index as u32 * 2;
        let low = unsafe { reg_read(self.base, reg) };
        let high = unsafe { reg_read(self.base, reg + 1) };
        Some(RedirectionEntry::from_bits(
            ((high as u64) << 32) | low as u64,
        ))
    }

    /// Write a redirection entry; the high half first so a partially
    /// written entry is never unmasked at a stale destination.
    pub fn write_entry(&self, index: u8, entry: RedirectionEntry) -> Result<(), ApicError> {
        if index >= self.entries {
            return Err(ApicError::IoApicError);
        }
        let reg = REG_REDIR_BASE + index as u32 * 2;
        unsafe {
            reg_write(self.base, reg + 1, (entry.bits() >> 32) as u32);
            reg_write(self.base, reg, entry.bits() as u32);
        }
        Ok(())
    }

    /// Mask every line on this controller.
    pub fn mask_all(&self) {
        for index in 0..self.entries {
            let _ = self.write_entry(index, RedirectionEntry::MASKED);
        }
    }
}

// =============================================================================
// Routing Interface
// =============================================================================

/// Route an external source to `vector` on the CPU with `dest_apic_id`.
///
/// The source is first translated through the override table; polarity
/// and trigger default to the source's bus conventions unless the
/// override says otherwise or the caller forces them.
pub fn route_source(
    source: u8,
    dest_apic_id: u8,
    vector: u8,
    polarity: Option<Polarity>,
    trigger: Option<TriggerMode>,
) -> Result<u32, ApicError> {
    let (gsi, ovr) = source_to_gsi(source);

    let polarity = polarity.unwrap_or_else(|| match &ovr {
        Some(o) if o.active_low() => Polarity::ActiveLow,
        _ => Polarity::ActiveHigh,
    });
    let trigger = trigger.unwrap_or_else(|| match &ovr {
        Some(o) if o.level_triggered() => TriggerMode::Level,
        _ => TriggerMode::Edge,
    });

    let ioapic = for_gsi(gsi).ok_or(ApicError::IoApicError)?;
    let entry = RedirectionEntry::new(vector, DeliveryMode::Fixed, polarity, trigger, dest_apic_id);
    ioapic.write_entry((gsi - ioapic.gsi_base()) as u8, entry)?;
    Ok(gsi)
}

/// Mask a routed GSI.
pub fn mask_gsi(gsi: u32) -> Result<(), ApicError> {
    let ioapic = for_gsi(gsi).ok_or(ApicError::IoApicError)?;
    let index = (gsi - ioapic.gsi_base()) as u8;
    let mut entry = ioapic.read_entry(index).ok_or(ApicError::IoApicError)?;
    entry.set_masked(true);
    ioapic.write_entry(index, entry)
}

/// Unmask a routed GSI.
pub fn unmask_gsi(gsi: u32) -> Result<(), ApicError> {
    let ioapic = for_gsi(gsi).ok_or(ApicError::IoApicError)?;
    let index = (gsi - ioapic.gsi_base()) as u8;
    let mut entry = ioapic.read_entry(index).ok_or(ApicError::IoApicError)?;
    entry.set_masked(false);
    ioapic.write_entry(index, entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_encoding() {
        let entry = RedirectionEntry::new(
            0x30,
            DeliveryMode::Fixed,
            Polarity::ActiveLow,
            TriggerMode::Level,
            5,
        );
        assert_eq!(entry.vector(), 0x30);
        assert_eq!(entry.destination(), 5);
        assert_eq!(entry.polarity(), Polarity::ActiveLow);
        assert_eq!(entry.trigger_mode(), TriggerMode::Level);
        assert!(!entry.is_masked());
    }

    #[test]
    fn test_entry_mask_roundtrip() {
        let mut entry = RedirectionEntry::new(
            0x21,
            DeliveryMode::Fixed,
            Polarity::ActiveHigh,
            TriggerMode::Edge,
            0,
        );
        entry.set_masked(true);
        assert!(entry.is_masked());
        entry.set_masked(false);
        assert!(!entry.is_masked());
        assert_eq!(entry.vector(), 0x21);
    }

    #[test]
    fn test_masked_constant() {
        assert!(RedirectionEntry::MASKED.is_masked());
        assert_eq!(RedirectionEntry::MASKED.vector(), 0);
    }

    #[test]
    fn test_override_translation() {
        set_overrides(&[SourceOverride {
            bus: 0,
            source: 0,
            gsi: 2,
            flags: 0,
        }]);
        let (gsi, ovr) = source_to_gsi(0);
        assert_eq!(gsi, 2);
        assert!(ovr.is_some());

        let (gsi, ovr) = source_to_gsi(4);
        assert_eq!(gsi, 4);
        assert!(ovr.is_none());
        set_overrides(&[]);
    }
}
