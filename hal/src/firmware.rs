//! # Firmware-Provided Platform Description
//!
//! The boot collaborator parses the firmware tables (processor
//! enumeration, interrupt controllers, interrupt source overrides, NUMA
//! affinity and distances) and hands the result over as one immutable
//! structure. Nothing in the SMP core reads firmware tables itself.
//!
//! When no description is available the platform degrades to a
//! synthesized single-processor, single-node layout.

use arrayvec::ArrayVec;

use crate::{MAX_CPUS, MAX_NUMA_NODES};

/// Maximum I/O interrupt controllers carried in the description.
pub const MAX_IO_CONTROLLERS: usize = 8;

/// Maximum interrupt source overrides carried in the description.
pub const MAX_SOURCE_OVERRIDES: usize = 16;

/// Maximum memory ranges per NUMA node.
pub const MAX_NODE_RANGES: usize = 8;

/// One enumerated logical processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorEntry {
    /// Logical index assigned at enumeration (BSP = 0).
    pub logical_id: u32,
    /// Hardware interrupt-controller (APIC) id.
    pub apic_id: u32,
    /// Firmware (ACPI) processor id.
    pub acpi_id: u32,
    /// Whether the firmware marked this processor usable.
    pub enabled: bool,
}

/// One external interrupt controller (I/O APIC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoControllerEntry {
    /// Controller id.
    pub id: u8,
    /// Physical MMIO base of the controller.
    pub mmio_base: u64,
    /// First global system interrupt handled by this controller.
    pub gsi_base: u32,
}

/// Interrupt source override: a bus-relative source that firmware
/// rerouted to a different global line, possibly with non-default
/// polarity or trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOverride {
    /// Source bus (0 = ISA).
    pub bus: u8,
    /// Bus-relative source number.
    pub source: u8,
    /// Resulting global system interrupt.
    pub gsi: u32,
    /// Raw polarity/trigger flags as delivered by firmware.
    pub flags: u16,
}

impl SourceOverride {
    /// Active-low polarity requested.
    pub fn active_low(&self) -> bool {
        self.flags & 0x3 == 0x3
    }

    /// Level trigger requested.
    pub fn level_triggered(&self) -> bool {
        (self.flags >> 2) & 0x3 == 0x3
    }
}

/// A physical memory range owned by one NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// Physical start address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
}

/// One NUMA node's memory description.
#[derive(Debug, Clone, Default)]
pub struct NodeMemory {
    /// Memory ranges belonging to this node.
    pub ranges: ArrayVec<MemoryRange, MAX_NODE_RANGES>,
}

/// Parsed platform description.
#[derive(Debug, Clone, Default)]
pub struct PlatformInfo {
    /// Enumerated processors, BSP first.
    pub processors: ArrayVec<ProcessorEntry, MAX_CPUS>,
    /// External interrupt controllers.
    pub io_controllers: ArrayVec<IoControllerEntry, MAX_IO_CONTROLLERS>,
    /// Interrupt source overrides.
    pub overrides: ArrayVec<SourceOverride, MAX_SOURCE_OVERRIDES>,
    /// Number of NUMA nodes (0 or 1 means UMA).
    pub node_count: u32,
    /// Per-node memory ranges, indexed by node id.
    pub node_memory: ArrayVec<NodeMemory, MAX_NUMA_NODES>,
    /// NUMA distance matrix, row-major `node_count × node_count`.
    /// Empty when firmware provided no locality information.
    pub distances: ArrayVec<u8, { MAX_NUMA_NODES * MAX_NUMA_NODES }>,
    /// APIC id → NUMA node assignments, parallel to `processors`.
    pub processor_nodes: ArrayVec<u8, MAX_CPUS>,
}

impl PlatformInfo {
    /// Distance between two nodes; the local distance (10) when the
    /// matrix is absent or out of range.
    pub fn distance(&self, from: usize, to: usize) -> u8 {
        let n = self.node_count as usize;
        if from < n && to < n {
            if let Some(&d) = self.distances.get(from * n + to) {
                return d;
            }
            // No SLIT: local = 10, remote = 20.
            return if from == to { 10 } else { 20 };
        }
        10
    }

    /// NUMA node of a processor by position in `processors`.
    pub fn processor_node(&self, index: usize) -> u8 {
        self.processor_nodes.get(index).copied().unwrap_or(0)
    }

    /// Synthesize a single-processor, single-node description for use
    /// when firmware input is absent.
    pub fn synthesize_uniprocessor(bsp_apic_id: u32) -> Self {
        let mut info = Self::default();
        info.processors.push(ProcessorEntry {
            logical_id: 0,
            apic_id: bsp_apic_id,
            acpi_id: 0,
            enabled: true,
        });
        info.processor_nodes.push(0);
        info.node_count = 1;
        info.node_memory.push(NodeMemory::default());
        info
    }

    /// Count of enabled processors.
    pub fn enabled_processors(&self) -> usize {
        self.processors.iter().filter(|p| p.enabled).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_uniprocessor() {
        let info = PlatformInfo::synthesize_uniprocessor(3);
        assert_eq!(info.enabled_processors(), 1);
        assert_eq!(info.node_count, 1);
        assert_eq!(info.processors[0].apic_id, 3);
        assert_eq!(info.distance(0, 0), 10);
    }

    #[test]
    fn test_default_distances() {
        let mut info = PlatformInfo::default();
        info.node_count = 2;
        assert_eq!(info.distance(0, 0), 10);
        assert_eq!(info.distance(0, 1), 20);
    }

    #[test]
    fn test_explicit_distances() {
        let mut info = PlatformInfo::default();
        info.node_count = 2;
        for d in [10u8, 21, 21, 10] {
            info.distances.push(d);
        }
        assert_eq!(info.distance(0, 1), 21);
        assert_eq!(info.distance(1, 1), 10);
    }

    #[test]
    fn test_override_flags() {
        let ovr = SourceOverride {
            bus: 0,
            source: 0,
            gsi: 2,
            flags: 0b1111,
        };
        assert!(ovr.active_low());
        assert!(ovr.level_triggered());

        let conforming = SourceOverride {
            bus: 0,
            source: 9,
            gsi: 9,
            flags: 0,
        };
        assert!(!conforming.active_low());
        assert!(!conforming.level_triggered());
    }
}
