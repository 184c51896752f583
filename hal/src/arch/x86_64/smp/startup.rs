//! # Application Processor Startup
//!
//! INIT-SIPI-SIPI bring-up through a low-memory trampoline:
//!
//! 1. Copy the trampoline blob to the 4 KiB page at 0x8000
//! 2. Publish the AP's logical id, stack, page table, and entry point
//!    in the mailbox cell at a fixed offset of that page
//! 3. Send INIT, wait 10 ms, send STARTUP, wait 200 µs, send STARTUP
//!    again (the double STARTUP covers the hardware race the manuals
//!    document)
//! 4. Poll the mailbox ready flag for up to one second
//!
//! A timed-out AP is marked Offline and the system continues with the
//! processors that did come up. The whole protocol is serialized by a
//! mutex; exactly one AP is in flight at a time.

use core::sync::atomic::{AtomicU32, Ordering};

use super::cpu_info::{self, CpuState};
use super::SmpError;
use crate::arch::x86_64::apic::ipi;
use crate::arch::x86_64::timers::tsc;

// =============================================================================
// Layout
// =============================================================================

/// Physical address of the trampoline page. Below 1 MiB, 4 KiB aligned.
pub const AP_TRAMPOLINE_ADDR: u64 = 0x8000;

/// STARTUP vector encoding of the trampoline page.
pub const AP_STARTUP_VECTOR: u8 = (AP_TRAMPOLINE_ADDR >> 12) as u8;

/// Offset of the mailbox cell within the trampoline page.
pub const MAILBOX_OFFSET: u64 = 0xF00;

/// Mailbox field offsets relative to [`MAILBOX_OFFSET`].
pub mod mailbox {
    /// u64: stack top for the AP.
    pub const STACK_TOP: u64 = 0x00;
    /// u64: page-table root (CR3) for the AP.
    pub const CR3: u64 = 0x08;
    /// u64: 64-bit entry point, called as `entry(cpu_id)`.
    pub const ENTRY: u64 = 0x10;
    /// u32: logical id of the AP being brought up.
    pub const CPU_ID: u64 = 0x18;
    /// u32: handshake flag, raised by the AP once it is scheduled.
    pub const READY: u64 = 0x1C;
}

const _: () = {
    assert!(AP_TRAMPOLINE_ADDR < 0x10_0000);
    assert!(AP_TRAMPOLINE_ADDR % 0x1000 == 0);
};

// =============================================================================
// Timing
// =============================================================================

/// Wait after INIT before the first STARTUP.
const INIT_DELAY_US: u64 = 10_000;

/// Wait between the two STARTUPs.
const SIPI_DELAY_US: u64 = 200;

/// Handshake timeout.
const HANDSHAKE_TIMEOUT_MS: u64 = 1_000;

// =============================================================================
// State
// =============================================================================

/// Serializes AP bring-up; one AP in flight at a time.
static BOOT_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// Count of APs that completed the handshake.
static READY_COUNT: AtomicU32 = AtomicU32::new(0);

/// Number of APs that have completed the handshake so far.
pub fn ready_count() -> u32 {
    READY_COUNT.load(Ordering::Acquire)
}

/// Parameters for one AP launch.
#[derive(Debug, Clone, Copy)]
pub struct ApLaunch {
    /// Logical id assigned to the AP.
    pub cpu_id: usize,
    /// Hardware APIC id to signal.
    pub apic_id: u32,
    /// Top of the AP's kernel stack (NUMA-local, allocated by the
    /// caller).
    pub stack_top: u64,
    /// 64-bit entry point the trampoline jumps to with the logical id
    /// as argument.
    pub entry: extern "C" fn(u32) -> !,
}

// =============================================================================
// Mailbox Access
// =============================================================================

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        use super::trampoline;

        #[inline]
        unsafe fn mailbox_write_u64(field: u64, value: u64) {
            let addr = AP_TRAMPOLINE_ADDR + MAILBOX_OFFSET + field;
            unsafe { core::ptr::write_volatile(addr as *mut u64, value) }
        }

        #[inline]
        unsafe fn mailbox_write_u32(field: u64, value: u32) {
            let addr = AP_TRAMPOLINE_ADDR + MAILBOX_OFFSET + field;
            unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
        }

        #[inline]
        unsafe fn mailbox_read_u32(field: u64) -> u32 {
            let addr = AP_TRAMPOLINE_ADDR + MAILBOX_OFFSET + field;
            unsafe { core::ptr::read_volatile(addr as *const u32) }
        }

        fn read_cr3() -> u64 {
            let cr3: u64;
            unsafe {
                core::arch::asm!(
                    "mov {}, cr3",
                    out(reg) cr3,
                    options(nostack, nomem, preserves_flags),
                );
            }
            cr3
        }

        /// Copy the trampoline blob into the low-memory page.
        fn install_trampoline() -> Result<(), SmpError> {
            let blob = trampoline::blob();
            if blob.len() as u64 > MAILBOX_OFFSET {
                return Err(SmpError::TrampolineNotReady);
            }
            unsafe {
                core::ptr::copy_nonoverlapping(
                    blob.as_ptr(),
                    AP_TRAMPOLINE_ADDR as *mut u8,
                    blob.len(),
                );
            }
            Ok(())
        }

        fn publish_launch(launch: &ApLaunch) {
            unsafe {
                mailbox_write_u64(mailbox::STACK_TOP, launch.stack_top);
                mailbox_write_u64(mailbox::CR3, read_cr3());
                mailbox_write_u64(mailbox::ENTRY, launch.entry as usize as u64);
                mailbox_write_u32(mailbox::CPU_ID, launch.cpu_id as u32);
                mailbox_write_u32(mailbox::READY, 0);
            }
            crate::sync::memory_barrier();
        }

        fn poll_ready() -> bool {
            for _ in 0..HANDSHAKE_TIMEOUT_MS {
                if unsafe { mailbox_read_u32(mailbox::READY) } != 0 {
                    return true;
                }
                tsc::delay_us(1_000);
            }
            false
        }

        /// Raise the handshake flag; runs on the AP once its scheduler
        /// state is live.
        pub fn signal_ready() {
            READY_COUNT.fetch_add(1, Ordering::SeqCst);
            unsafe { mailbox_write_u32(mailbox::READY, 1) };
        }
    } else {
        fn install_trampoline() -> Result<(), SmpError> {
            // No low memory to install into off-metal.
            Err(SmpError::TrampolineNotReady)
        }

        fn publish_launch(_launch: &ApLaunch) {}

        fn poll_ready() -> bool {
            false
        }

        /// Host stub for the AP-side handshake.
        pub fn signal_ready() {
            READY_COUNT.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Bring-Up
// =============================================================================

/// Bring one AP online.
///
/// On success the CPU record transitions Starting → Online and the
/// online/active mask bits are set. On failure the record is left
/// Offline and the error is returned; the caller continues with the
/// remaining CPUs.
pub fn boot_ap(launch: &ApLaunch) -> Result<(), SmpError> {
    let _serialized = BOOT_LOCK.lock();

    let info = cpu_info::get_cpu_info(launch.cpu_id).ok_or(SmpError::InvalidCpuId)?;
    info.set_state(CpuState::Starting);

    match boot_ap_inner(launch) {
        Ok(()) => {
            info.set_state(CpuState::Online);
            super::set_cpu_online(launch.cpu_id, true);
            log::info!(
                "SMP: CPU {} (APIC {}) online",
                launch.cpu_id,
                launch.apic_id
            );
            Ok(())
        }
        Err(err) => {
            info.set_state(CpuState::Offline);
            log::warn!(
                "SMP: CPU {} (APIC {}) failed to start: {}",
                launch.cpu_id,
                launch.apic_id,
                err
            );
            Err(err)
        }
    }
}

fn boot_ap_inner(launch: &ApLaunch) -> Result<(), SmpError> {
    install_trampoline()?;
    publish_launch(launch);

    ipi::send_init(launch.apic_id);
    tsc::delay_us(INIT_DELAY_US);

    ipi::send_startup(launch.apic_id, AP_STARTUP_VECTOR);
    tsc::delay_us(SIPI_DELAY_US);
    ipi::send_startup(launch.apic_id, AP_STARTUP_VECTOR);

    if poll_ready() {
        Ok(())
    } else {
        Err(SmpError::BringupTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn fake_entry(_cpu: u32) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn test_startup_vector_encodes_page() {
        assert_eq!(AP_STARTUP_VECTOR, 0x08);
        assert_eq!((AP_STARTUP_VECTOR as u64) << 12, AP_TRAMPOLINE_ADDR);
    }

    #[test]
    fn test_failed_bringup_leaves_cpu_offline() {
        // Off-metal the trampoline cannot be installed, which exercises
        // the failure leg: Starting -> Offline, masks untouched.
        let info = cpu_info::register_cpu(40, 41, 0, 0, false).unwrap();
        let launch = ApLaunch {
            cpu_id: 40,
            apic_id: 41,
            stack_top: 0,
            entry: fake_entry,
        };
        let err = boot_ap(&launch).unwrap_err();
        assert!(matches!(
            err,
            SmpError::TrampolineNotReady | SmpError::BringupTimeout
        ));
        assert_eq!(info.state(), CpuState::Offline);
        assert!(!super::super::is_cpu_online(40));
    }

    #[test]
    fn test_boot_unregistered_cpu_rejected() {
        let launch = ApLaunch {
            cpu_id: 41,
            apic_id: 99,
            stack_top: 0,
            entry: fake_entry,
        };
        assert!(matches!(boot_ap(&launch), Err(SmpError::InvalidCpuId)));
    }
}
