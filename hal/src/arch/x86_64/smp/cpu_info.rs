//! # CPU Topology Table
//!
//! One record per logical processor, built on the BSP from the firmware
//! description and updated through bring-up. Records are cache-line
//! aligned and never share a line, so state flips on one CPU do not
//! bounce another CPU's record.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::SmpError;
use crate::{CACHE_LINE_SIZE, MAX_CPUS};

// =============================================================================
// CPU State
// =============================================================================

/// Processor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    /// Not running (initial state, or failed/ejected).
    Offline = 0,
    /// Bring-up in progress.
    Starting = 1,
    /// Running and schedulable.
    Online = 2,
    /// Stopped by an emergency halt.
    Halted = 3,
}

impl From<u8> for CpuState {
    fn from(value: u8) -> Self {
        match value {
            1 => CpuState::Starting,
            2 => CpuState::Online,
            3 => CpuState::Halted,
            _ => CpuState::Offline,
        }
    }
}

// =============================================================================
// Feature Flags
// =============================================================================

bitflags::bitflags! {
    /// CPU feature bits relevant to the SMP core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u64 {
        /// x87 floating point.
        const FPU           = 1 << 0;
        /// SSE.
        const SSE           = 1 << 1;
        /// SSE2.
        const SSE2          = 1 << 2;
        /// SSE3.
        const SSE3          = 1 << 3;
        /// SSSE3.
        const SSSE3         = 1 << 4;
        /// SSE4.1.
        const SSE4_1        = 1 << 5;
        /// SSE4.2.
        const SSE4_2        = 1 << 6;
        /// AVX.
        const AVX           = 1 << 7;
        /// AVX2.
        const AVX2          = 1 << 8;
        /// AVX-512 foundation.
        const AVX512F       = 1 << 9;
        /// AES-NI.
        const AES           = 1 << 10;
        /// XSAVE/XRSTOR.
        const XSAVE         = 1 << 11;
        /// RDRAND.
        const RDRAND        = 1 << 12;
        /// Invariant (constant-rate) TSC.
        const INVARIANT_TSC = 1 << 13;
        /// x2APIC (register-based interrupt controller).
        const X2APIC        = 1 << 14;
        /// Process-context identifiers.
        const PCID          = 1 << 15;
        /// INVPCID instruction.
        const INVPCID       = 1 << 16;
    }
}

/// Detect the calling CPU's features via CPUID.
pub fn detect_features() -> CpuFeatures {
    use crate::arch::x86_64::apic::local::cpuid;

    let mut features = CpuFeatures::empty();

    let (_, _, ecx, edx) = cpuid(1);
    if edx & (1 << 0) != 0 {
        features |= CpuFeatures::FPU;
    }
    if edx & (1 << 25) != 0 {
        features |= CpuFeatures::SSE;
    }
    if edx & (1 << 26) != 0 {
        features |= CpuFeatures::SSE2;
    }
    if ecx & (1 << 0) != 0 {
        features |= CpuFeatures::SSE3;
    }
    if ecx & (1 << 9) != 0 {
        features |= CpuFeatures::SSSE3;
    }
    if ecx & (1 << 19) != 0 {
        features |= CpuFeatures::SSE4_1;
    }
    if ecx & (1 << 20) != 0 {
        features |= CpuFeatures::SSE4_2;
    }
    if ecx & (1 << 28) != 0 {
        features |= CpuFeatures::AVX;
    }
    if ecx & (1 << 25) != 0 {
        features |= CpuFeatures::AES;
    }
    if ecx & (1 << 26) != 0 {
        features |= CpuFeatures::XSAVE;
    }
    if ecx & (1 << 30) != 0 {
        features |= CpuFeatures::RDRAND;
    }
    if ecx & (1 << 21) != 0 {
        features |= CpuFeatures::X2APIC;
    }
    if ecx & (1 << 17) != 0 {
        features |= CpuFeatures::PCID;
    }

    let (_, ebx, _, _) = cpuid(7);
    if ebx & (1 << 5) != 0 {
        features |= CpuFeatures::AVX2;
    }
    if ebx & (1 << 16) != 0 {
        features |= CpuFeatures::AVX512F;
    }
    if ebx & (1 << 10) != 0 {
        features |= CpuFeatures::INVPCID;
    }

    let (_, _, _, edx) = cpuid(0x8000_0007);
    if edx & (1 << 8) != 0 {
        features |= CpuFeatures::INVARIANT_TSC;
    }

    features
}

/// Read base/max frequency (kHz) from CPUID leaf 0x16 when available.
pub fn detect_frequencies() -> (u32, u32) {
    use crate::arch::x86_64::apic::local::cpuid;

    let (max_leaf, _, _, _) = cpuid(0);
    if max_leaf < 0x16 {
        return (0, 0);
    }
    let (base_mhz, max_mhz, _, _) = cpuid(0x16);
    (base_mhz * 1000, max_mhz * 1000)
}

// =============================================================================
// Per-CPU Record
// =============================================================================

/// Information about one logical processor.
///
/// Aligned and padded to a cache line; fields are atomics so the record
/// can be published once and updated in place.
#[repr(C, align(64))]
pub struct CpuInfo {
    /// Logical CPU index.
    cpu_id: AtomicU32,
    /// Hardware interrupt-controller (APIC) id.
    apic_id: AtomicU32,
    /// Firmware (ACPI) processor id.
    acpi_id: AtomicU32,
    /// NUMA node.
    numa_node: AtomicU8,
    /// Physical package.
    package_id: AtomicU8,
    /// Core within package.
    core_id: AtomicU8,
    /// Hardware thread within core.
    thread_id: AtomicU8,
    /// Lifecycle state.
    state: AtomicU8,
    /// BSP marker.
    is_bsp: AtomicU8,
    /// Registered marker.
    present: AtomicU8,
    _pad0: u8,
    /// Feature bits.
    features: AtomicU64,
    /// Base frequency in kHz (0 = unknown).
    base_freq_khz: AtomicU32,
    /// Max frequency in kHz (0 = unknown).
    max_freq_khz: AtomicU32,
    /// Calibrated TSC frequency in Hz.
    tsc_hz: AtomicU64,
    _pad1: [u8; 16],
}

static_assertions::const_assert_eq!(core::mem::size_of::<CpuInfo>() % CACHE_LINE_SIZE, 0);
static_assertions::const_assert_eq!(core::mem::align_of::<CpuInfo>(), CACHE_LINE_SIZE);

impl CpuInfo {
    const fn new() -> Self {
        Self {
            cpu_id: AtomicU32::new(u32::MAX),
            apic_id: AtomicU32::new(u32::MAX),
            acpi_id: AtomicU32::new(u32::MAX),
            numa_node: AtomicU8::new(0),
            package_id: AtomicU8::new(0),
            core_id: AtomicU8::new(0),
            thread_id: AtomicU8::new(0),
            state: AtomicU8::new(CpuState::Offline as u8),
            is_bsp: AtomicU8::new(0),
            present: AtomicU8::new(0),
            _pad0: 0,
            features: AtomicU64::new(0),
            base_freq_khz: AtomicU32::new(0),
            max_freq_khz: AtomicU32::new(0),
            tsc_hz: AtomicU64::new(0),
            _pad1: [0; 16],
        }
    }

    /// Logical CPU index.
    #[inline]
    pub fn cpu_id(&self) -> u32 {
        self.cpu_id.load(Ordering::Relaxed)
    }

    /// Hardware APIC id.
    #[inline]
    pub fn apic_id(&self) -> u32 {
        self.apic_id.load(Ordering::Relaxed)
    }

    /// Firmware processor id.
    #[inline]
    pub fn acpi_id(&self) -> u32 {
        self.acpi_id.load(Ordering::Relaxed)
    }

    /// NUMA node index.
    #[inline]
    pub fn numa_node(&self) -> u8 {
        self.numa_node.load(Ordering::Relaxed)
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> CpuState {
        CpuState::from(self.state.load(Ordering::Acquire))
    }

    /// Transition the lifecycle state.
    #[inline]
    pub fn set_state(&self, state: CpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether this record is the BSP.
    #[inline]
    pub fn is_bsp(&self) -> bool {
        self.is_bsp.load(Ordering::Relaxed) != 0
    }

    /// Detected feature set.
    #[inline]
    pub fn features(&self) -> CpuFeatures {
        CpuFeatures::from_bits_truncate(self.features.load(Ordering::Relaxed))
    }

    /// Publish the detected feature set.
    pub fn set_features(&self, features: CpuFeatures) {
        self.features.store(features.bits(), Ordering::SeqCst);
    }

    /// Publish detected frequencies (kHz).
    pub fn set_frequencies(&self, base_khz: u32, max_khz: u32) {
        self.base_freq_khz.store(base_khz, Ordering::SeqCst);
        self.max_freq_khz.store(max_khz, Ordering::SeqCst);
    }

    /// Base frequency in kHz.
    pub fn base_frequency_khz(&self) -> u32 {
        self.base_freq_khz.load(Ordering::Relaxed)
    }

    /// Max (turbo) frequency in kHz.
    pub fn max_frequency_khz(&self) -> u32 {
        self.max_freq_khz.load(Ordering::Relaxed)
    }

    /// Publish the calibrated TSC frequency.
    pub fn set_tsc_frequency(&self, hz: u64) {
        self.tsc_hz.store(hz, Ordering::SeqCst);
    }

    /// Calibrated TSC frequency in Hz.
    pub fn tsc_frequency(&self) -> u64 {
        self.tsc_hz.load(Ordering::Relaxed)
    }

    /// Package/core/thread placement.
    pub fn set_topology_ids(&self, package: u8, core: u8, thread: u8) {
        self.package_id.store(package, Ordering::SeqCst);
        self.core_id.store(core, Ordering::SeqCst);
        self.thread_id.store(thread, Ordering::SeqCst);
    }

    /// Package id.
    pub fn package_id(&self) -> u8 {
        self.package_id.load(Ordering::Relaxed)
    }

    /// Core id within the package.
    pub fn core_id(&self) -> u8 {
        self.core_id.load(Ordering::Relaxed)
    }

    /// Hardware thread id within the core.
    pub fn thread_id(&self) -> u8 {
        self.thread_id.load(Ordering::Relaxed)
    }

    fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire) != 0
    }
}

// =============================================================================
// Global Table
// =============================================================================

static CPU_INFO: [CpuInfo; MAX_CPUS] = [const { CpuInfo::new() }; MAX_CPUS];

/// APIC id → logical id map for ids that fit the table.
static APIC_TO_CPU: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(u32::MAX) }; MAX_CPUS];

/// Register a processor record.
pub fn register_cpu(
    cpu_id: usize,
    apic_id: u32,
    acpi_id: u32,
    numa_node: u8,
    is_bsp: bool,
) -> Result<&'static CpuInfo, SmpError> {
    if cpu_id >= MAX_CPUS {
        return Err(SmpError::InvalidCpuId);
    }

    let info = &CPU_INFO[cpu_id];
    info.cpu_id.store(cpu_id as u32, Ordering::SeqCst);
    info.apic_id.store(apic_id, Ordering::SeqCst);
    info.acpi_id.store(acpi_id, Ordering::SeqCst);
    info.numa_node.store(numa_node, Ordering::SeqCst);
    info.is_bsp
        .store(if is_bsp { 1 } else { 0 }, Ordering::SeqCst);
    info.present.store(1, Ordering::Release);

    if (apic_id as usize) < MAX_CPUS {
        APIC_TO_CPU[apic_id as usize].store(cpu_id as u32, Ordering::SeqCst);
    }

    Ok(info)
}

/// Look up a registered record by logical id.
pub fn get_cpu_info(cpu_id: usize) -> Option<&'static CpuInfo> {
    if cpu_id < MAX_CPUS && CPU_INFO[cpu_id].is_present() {
        Some(&CPU_INFO[cpu_id])
    } else {
        None
    }
}

/// Look up a registered record by APIC id.
pub fn cpu_for_apic_id(apic_id: u32) -> Option<u32> {
    if (apic_id as usize) < MAX_CPUS {
        let cpu = APIC_TO_CPU[apic_id as usize].load(Ordering::Relaxed);
        if cpu != u32::MAX {
            return Some(cpu);
        }
    }
    // Sparse APIC ids fall back to a scan.
    CPU_INFO
        .iter()
        .find(|c| c.is_present() && c.apic_id() == apic_id)
        .map(|c| c.cpu_id())
}

/// NUMA node of a CPU; node 0 for unregistered ids.
pub fn cpu_to_node(cpu_id: usize) -> u8 {
    get_cpu_info(cpu_id).map(|c| c.numa_node()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        // High indices keep clear of records other tests create.
        let info = register_cpu(60, 61, 7, 1, false).unwrap();
        assert_eq!(info.cpu_id(), 60);
        assert_eq!(info.apic_id(), 61);
        assert_eq!(info.acpi_id(), 7);
        assert_eq!(info.numa_node(), 1);
        assert!(!info.is_bsp());
        assert_eq!(info.state(), CpuState::Offline);

        assert!(get_cpu_info(60).is_some());
        assert_eq!(cpu_for_apic_id(61), Some(60));
        assert_eq!(cpu_to_node(60), 1);
    }

    #[test]
    fn test_register_out_of_range() {
        assert!(matches!(
            register_cpu(MAX_CPUS, 0, 0, 0, false),
            Err(SmpError::InvalidCpuId)
        ));
    }

    #[test]
    fn test_state_transitions() {
        let info = register_cpu(61, 62, 8, 0, false).unwrap();
        assert_eq!(info.state(), CpuState::Offline);
        info.set_state(CpuState::Starting);
        assert_eq!(info.state(), CpuState::Starting);
        info.set_state(CpuState::Online);
        assert_eq!(info.state(), CpuState::Online);
        info.set_state(CpuState::Halted);
        assert_eq!(info.state(), CpuState::Halted);
        info.set_state(CpuState::Offline);
    }

    #[test]
    fn test_feature_detection_runs() {
        // Any x86_64 CPU this test runs on has at least SSE2.
        let features = detect_features();
        assert!(features.contains(CpuFeatures::SSE2));
    }

    #[test]
    fn test_record_is_cache_line_padded() {
        assert_eq!(core::mem::size_of::<CpuInfo>() % 64, 0);
    }

    #[test]
    fn test_unknown_cpu_defaults_to_node_zero() {
        assert_eq!(cpu_to_node(59), 0);
    }
}
