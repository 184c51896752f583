//! # Orion Boot Orchestration
//!
//! The one place that knows the bring-up order:
//!
//! 1. **Topology**: consume the firmware platform description (or
//!    synthesize a uniprocessor one when it is absent) and register
//!    every processor record
//! 2. **Interrupt controller**: local APIC on the BSP, I/O APIC
//!    registration, source overrides, timer calibration
//! 3. **NUMA allocator**: per-node buddy lists seeded from the
//!    firmware memory map
//! 4. **Scheduler**: BSP run queue and idle thread, periodic tick
//! 5. **AP bring-up**: serialized INIT-SIPI-SIPI per enabled
//!    processor, each with a NUMA-local kernel stack; failures leave
//!    the CPU Offline and the boot continues
//!
//! Global state is published with release stores during this sequence
//! and is immutable once the CPUs are online.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

use core::fmt;

use orion_hal::arch::x86_64::apic::{self, ioapic};
use orion_hal::arch::x86_64::irq;
use orion_hal::arch::x86_64::smp::{self, cpu_info, per_cpu, startup};
use orion_hal::arch::x86_64::timers::tsc;
use orion_hal::firmware::PlatformInfo;
use orion_hal::MAX_CPUS;

use orion_execution::balance;
use orion_execution::sched;

// =============================================================================
// Constants
// =============================================================================

/// Kernel stack size for each AP.
pub const AP_STACK_SIZE: usize = 64 * 1024;

// =============================================================================
// Error Type
// =============================================================================

/// Boot orchestration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// Interrupt controller bring-up failed.
    Apic(apic::ApicError),
    /// SMP table problem.
    Smp(smp::SmpError),
    /// Scheduler initialization failed.
    Sched(orion_execution::SchedError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Apic(err) => write!(f, "APIC init failed: {}", err),
            InitError::Smp(err) => write!(f, "SMP init failed: {}", err),
            InitError::Sched(err) => write!(f, "scheduler init failed: {}", err),
        }
    }
}

impl From<apic::ApicError> for InitError {
    fn from(err: apic::ApicError) -> Self {
        InitError::Apic(err)
    }
}

impl From<smp::SmpError> for InitError {
    fn from(err: smp::SmpError) -> Self {
        InitError::Smp(err)
    }
}

impl From<orion_execution::SchedError> for InitError {
    fn from(err: orion_execution::SchedError) -> Self {
        InitError::Sched(err)
    }
}

// =============================================================================
// BSP Bring-Up
// =============================================================================

/// Bring the system up on the bootstrap processor.
///
/// With `platform = None` (firmware topology absent) the system
/// degrades to a single synthesized processor.
pub fn init_bsp(platform: Option<&PlatformInfo>) -> Result<(), InitError> {
    let bsp_apic_id = orion_hal::arch::x86_64::apic::local::read_self_id();

    let synthesized;
    let info = match platform {
        Some(info) if !info.processors.is_empty() => info,
        _ => {
            log::warn!("init: firmware topology absent, degrading to uniprocessor");
            synthesized = PlatformInfo::synthesize_uniprocessor(bsp_apic_id);
            &synthesized
        }
    };

    // --- 1. Topology -----------------------------------------------------
    let bsp_cpu_id = register_topology(info, bsp_apic_id)?;

    // --- 2. Interrupt controller -----------------------------------------
    per_cpu::init_bsp(bsp_apic_id)?;
    unsafe { apic::init(None)? };
    for controller in &info.io_controllers {
        unsafe { ioapic::register(controller.mmio_base, controller.gsi_base)? };
    }
    ioapic::set_overrides(&info.overrides);

    let bsp_info = cpu_info::get_cpu_info(bsp_cpu_id).ok_or(smp::SmpError::InvalidCpuId)?;
    bsp_info.set_features(cpu_info::detect_features());
    let (base_khz, max_khz) = cpu_info::detect_frequencies();
    bsp_info.set_frequencies(base_khz, max_khz);
    bsp_info.set_tsc_frequency(tsc::calibrate());

    // --- 3. NUMA allocator -----------------------------------------------
    orion_memory::init(info);

    // --- 4. Scheduler ----------------------------------------------------
    let bsp_node = cpu_info::cpu_to_node(bsp_cpu_id) as u32;
    sched::init_cpu(bsp_cpu_id, bsp_node)?;
    apic::local::start_periodic_tick();

    bsp_info.set_state(cpu_info::CpuState::Online);
    smp::set_cpu_online(bsp_cpu_id, true);

    // --- 5. Application processors ---------------------------------------
    start_all_aps(info, bsp_apic_id);

    log::info!(
        "init: {} of {} CPU(s) online",
        smp::cpu_count(),
        smp::possible_cpu_count()
    );
    Ok(())
}

/// Register every described processor; returns the BSP's logical id.
fn register_topology(info: &PlatformInfo, bsp_apic_id: u32) -> Result<usize, InitError> {
    let mut bsp_cpu_id = 0usize;

    for (index, entry) in info.processors.iter().enumerate() {
        let cpu_id = entry.logical_id as usize;
        if cpu_id >= MAX_CPUS {
            log::warn!("init: processor {} beyond CPU limit, ignored", cpu_id);
            continue;
        }
        let node = info.processor_node(index);
        let is_bsp = entry.apic_id == bsp_apic_id;
        cpu_info::register_cpu(cpu_id, entry.apic_id, entry.acpi_id, node, is_bsp)?;
        if is_bsp {
            bsp_cpu_id = cpu_id;
        }
    }

    smp::set_possible_cpu_count(info.processors.len() as u32);
    smp::set_bsp_cpu_id(bsp_cpu_id as u32);
    Ok(bsp_cpu_id)
}

/// Bring up every enabled non-BSP processor, one at a time. Stacks and
/// run queues are placed on each CPU's own NUMA node; a CPU that fails
/// its handshake stays Offline and the loop continues.
fn start_all_aps(info: &PlatformInfo, bsp_apic_id: u32) {
    for entry in &info.processors {
        if !entry.enabled || entry.apic_id == bsp_apic_id {
            continue;
        }
        let cpu_id = entry.logical_id as usize;
        if cpu_id >= MAX_CPUS {
            continue;
        }
        let node = cpu_info::cpu_to_node(cpu_id) as u32;

        let stack_top = match orion_memory::kmalloc_node(AP_STACK_SIZE, node) {
            Ok(base) => base.as_ptr() as u64 + AP_STACK_SIZE as u64,
            Err(err) => {
                log::warn!("init: no stack for CPU {} ({}), skipping", cpu_id, err);
                continue;
            }
        };

        let launch = startup::ApLaunch {
            cpu_id,
            apic_id: entry.apic_id,
            stack_top,
            entry: ap_entry,
        };
        // Failure already logged and the record left Offline.
        let _ = startup::boot_ap(&launch);
    }
}

// =============================================================================
// AP Entry
// =============================================================================

/// First Rust code on a freshly started AP, entered from the
/// trampoline with its logical id.
extern "C" fn ap_entry(cpu_id: u32) -> ! {
    let cpu_id = cpu_id as usize;

    // Local interrupt controller first; everything below may log.
    if let Err(err) = unsafe { apic::init_for_ap() } {
        log::error!("init: AP {} APIC init failed: {}", cpu_id, err);
    }

    let apic_id = orion_hal::arch::x86_64::apic::local::read_self_id();
    let _ = per_cpu::init_ap(cpu_id, apic_id);

    if let Some(info) = cpu_info::get_cpu_info(cpu_id) {
        info.set_features(cpu_info::detect_features());
        let (base_khz, max_khz) = cpu_info::detect_frequencies();
        info.set_frequencies(base_khz, max_khz);
        info.set_tsc_frequency(tsc::calibrate());
    }

    let node = cpu_info::cpu_to_node(cpu_id) as u32;
    if let Err(err) = sched::init_cpu(cpu_id, node) {
        log::error!("init: AP {} scheduler init failed: {}", cpu_id, err);
    }

    // Handshake: the BSP promotes this CPU to Online when it sees the
    // flag.
    startup::signal_ready();

    unsafe { irq::irq_enable() };
    idle_loop(cpu_id)
}

// =============================================================================
// Idle Loop
// =============================================================================

/// Per-CPU idle loop: schedule when work is queued, otherwise try to
/// pull work from the busiest peer, then halt until the next interrupt.
pub fn idle_loop(cpu_id: usize) -> ! {
    loop {
        let runnable = sched::stats(cpu_id).map(|s| s.nr_running).unwrap_or(0);
        if runnable > 0 {
            sched::schedule();
            continue;
        }

        // The idle path always attempts a balance; the periodic flag
        // only adds cadence on busy CPUs.
        let _ = sched::take_need_balance();
        if balance::idle_balance(cpu_id) > 0 {
            sched::schedule();
            continue;
        }

        orion_hal::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_hal::firmware::ProcessorEntry;
    use std::sync::Mutex;

    static INIT_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_uniprocessor_fallback_boot() {
        // Firmware absent: the BSP comes up alone with a synthesized
        // topology and the system stays functional.
        let _guard = INIT_TEST_LOCK.lock().unwrap();
        init_bsp(None).unwrap();

        assert_eq!(smp::possible_cpu_count(), 1);
        assert_eq!(smp::cpu_count(), 1);
        let bsp = smp::bsp_cpu_id() as usize;
        assert!(smp::is_cpu_online(bsp));

        let info = cpu_info::get_cpu_info(bsp).unwrap();
        assert!(info.is_bsp());
        assert_eq!(info.state(), cpu_info::CpuState::Online);

        // The BSP run queue and idle thread exist.
        assert!(sched::stats(bsp).is_some());
    }

    #[test]
    fn test_register_topology_marks_bsp() {
        let _guard = INIT_TEST_LOCK.lock().unwrap();
        let mut info = PlatformInfo::default();
        for (logical, apic) in [(30u32, 130u32), (31, 131)] {
            info.processors.push(ProcessorEntry {
                logical_id: logical,
                apic_id: apic,
                acpi_id: logical,
                enabled: true,
            });
            info.processor_nodes.push(0);
        }
        info.node_count = 1;

        let bsp = register_topology(&info, 131).unwrap();
        assert_eq!(bsp, 31);
        assert!(cpu_info::get_cpu_info(31).unwrap().is_bsp());
        assert!(!cpu_info::get_cpu_info(30).unwrap().is_bsp());
    }
}
