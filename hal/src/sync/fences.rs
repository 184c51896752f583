//! # Memory Fences
//!
//! Ordering primitives the scheduler relies on to order the publish of
//! `current_thread` and the clearing of the reschedule flag against
//! incoming IPIs.

use core::sync::atomic::{compiler_fence, fence, Ordering};

/// Full memory barrier.
#[inline]
pub fn memory_barrier() {
    fence(Ordering::SeqCst);
}

/// Read (acquire) barrier.
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Write (release) barrier.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Compiler-only barrier; prevents reordering without emitting a fence
/// instruction.
#[inline]
pub fn compiler_barrier() {
    compiler_fence(Ordering::SeqCst);
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Serializing MFENCE instruction.
        #[inline]
        pub fn mfence() {
            unsafe {
                core::arch::asm!("mfence", options(nostack, preserves_flags));
            }
        }

        /// Load fence (LFENCE).
        #[inline]
        pub fn lfence() {
            unsafe {
                core::arch::asm!("lfence", options(nostack, preserves_flags));
            }
        }

        /// Store fence (SFENCE).
        #[inline]
        pub fn sfence() {
            unsafe {
                core::arch::asm!("sfence", options(nostack, preserves_flags));
            }
        }
    }
}
