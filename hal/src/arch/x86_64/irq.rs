//! # Interrupt Flag Control
//!
//! Save/disable/restore of the local interrupt-enable flag (RFLAGS.IF).
//! The IRQ-saving lock variants capture the flag before disabling so
//! nested sections restore the state they found.
//!
//! Host builds compile these as no-ops: the flag does not exist outside
//! ring 0, and the locking logic above must stay testable.

/// Saved interrupt-enable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags {
    enabled: bool,
}

impl IrqFlags {
    /// Whether interrupts were enabled when the state was captured.
    #[inline]
    pub fn were_enabled(&self) -> bool {
        self.enabled
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        /// Check whether interrupts are currently enabled.
        #[inline]
        pub fn irqs_enabled() -> bool {
            let rflags: u64;
            unsafe {
                core::arch::asm!(
                    "pushfq",
                    "pop {}",
                    out(reg) rflags,
                    options(nomem, preserves_flags),
                );
            }
            rflags & (1 << 9) != 0
        }

        /// Capture the interrupt flag and disable interrupts.
        #[inline]
        pub fn irq_save() -> IrqFlags {
            let enabled = irqs_enabled();
            unsafe {
                core::arch::asm!("cli", options(nostack, nomem));
            }
            IrqFlags { enabled }
        }

        /// Restore a previously captured interrupt flag.
        #[inline]
        pub fn irq_restore(flags: IrqFlags) {
            if flags.enabled {
                unsafe {
                    core::arch::asm!("sti", options(nostack, nomem));
                }
            }
        }

        /// Enable interrupts.
        ///
        /// # Safety
        ///
        /// The caller must be at a point where taking an interrupt is
        /// valid (IDT installed, per-CPU state consistent).
        #[inline]
        pub unsafe fn irq_enable() {
            unsafe {
                core::arch::asm!("sti", options(nostack, nomem));
            }
        }

        /// Disable interrupts.
        #[inline]
        pub fn irq_disable() {
            unsafe {
                core::arch::asm!("cli", options(nostack, nomem));
            }
        }
    } else {
        /// Check whether interrupts are currently enabled.
        #[inline]
        pub fn irqs_enabled() -> bool {
            false
        }

        /// Capture the interrupt flag and disable interrupts.
        #[inline]
        pub fn irq_save() -> IrqFlags {
            IrqFlags { enabled: false }
        }

        /// Restore a previously captured interrupt flag.
        #[inline]
        pub fn irq_restore(_flags: IrqFlags) {}

        /// Enable interrupts.
        ///
        /// # Safety
        ///
        /// No-op outside bare metal.
        #[inline]
        pub unsafe fn irq_enable() {}

        /// Disable interrupts.
        #[inline]
        pub fn irq_disable() {}
    }
}
