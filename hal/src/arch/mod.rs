//! # Architecture Support
//!
//! Architecture selection and the small arch-neutral surface the rest of
//! the HAL builds on (CPU pause hint, interrupt flag save/restore).

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;

        pub use x86_64::irq::{irq_restore, irq_save, irqs_enabled, IrqFlags};
        pub use x86_64::{halt, pause};
    } else {
        compile_error!("orion-hal: unsupported target architecture");
    }
}
