//! # x86_64 Architecture Support
//!
//! APIC interrupt plumbing, SMP bring-up, per-CPU data, timing sources,
//! and interrupt-flag control for 64-bit x86.

pub mod apic;
pub mod context;
pub mod irq;
pub mod smp;
pub mod timers;

/// CPU pause hint for spin-wait loops.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Halt the CPU until the next interrupt.
///
/// On non-bare-metal builds this is a pause, so idle loops written
/// against it stay runnable in tests.
#[inline]
pub fn halt() {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "none")] {
            unsafe {
                core::arch::asm!("hlt", options(nostack, nomem));
            }
        } else {
            core::hint::spin_loop();
        }
    }
}
