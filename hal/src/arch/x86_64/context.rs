//! # CPU Context Switching
//!
//! Saved-context blob and the stack-switching primitive. The context is
//! just the kernel stack pointer; the callee-saved register frame lives
//! on the stack itself, so a switch is push-regs / swap-rsp / pop-regs.

/// Saved CPU context for a suspended thread.
#[derive(Debug)]
#[repr(C)]
pub struct Context {
    /// Kernel stack pointer at suspension.
    rsp: u64,
}

impl Context {
    /// An empty context; must be initialized before the first switch in.
    pub const fn empty() -> Self {
        Self { rsp: 0 }
    }

    /// Stack pointer of the saved frame.
    pub fn stack_pointer(&self) -> u64 {
        self.rsp
    }
}

/// Number of callee-saved slots in the switch frame:
/// rflags, r15, r14, r13, r12, rbx, rbp, return address.
const SWITCH_FRAME_WORDS: usize = 8;

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        /// Initial RFLAGS for a fresh thread: reserved bit 1 plus IF so
        /// the thread starts with interrupts enabled.
        const INITIAL_RFLAGS: u64 = 0x202;

        impl Context {
            /// Prepare a fresh context so the first switch into it lands
            /// in `entry(arg)` on the given stack.
            ///
            /// # Safety
            ///
            /// `stack_top` must be the exclusive, 16-byte-aligned top of
            /// a live kernel stack.
            pub unsafe fn init(
                &mut self,
                stack_top: *mut u8,
                entry: extern "C" fn(usize) -> !,
                arg: usize,
            ) {
                let mut sp = stack_top as *mut u64;
                unsafe {
                    // Frame popped by `switch`, bottom to top of stack:
                    // return address first (consumed by `ret`).
                    sp = sp.sub(1);
                    sp.write(thread_entry_thunk as usize as u64);
                    sp = sp.sub(1);
                    sp.write(0); // rbp
                    sp = sp.sub(1);
                    sp.write(0); // rbx
                    sp = sp.sub(1);
                    sp.write(entry as usize as u64); // r12 = entry
                    sp = sp.sub(1);
                    sp.write(arg as u64); // r13 = arg
                    sp = sp.sub(1);
                    sp.write(0); // r14
                    sp = sp.sub(1);
                    sp.write(0); // r15
                    sp = sp.sub(1);
                    sp.write(INITIAL_RFLAGS);
                }
                self.rsp = sp as u64;
                debug_assert_eq!(
                    self.rsp,
                    stack_top as u64 - (SWITCH_FRAME_WORDS * 8) as u64
                );
            }
        }

        /// First instruction stream of every new thread: forwards the
        /// argument held in r13 to the entry point held in r12. The
        /// pushed zero keeps the entry ABI-aligned and catches a return
        /// from a never-returning entry with a null jump.
        #[unsafe(naked)]
        unsafe extern "C" fn thread_entry_thunk() -> ! {
            core::arch::naked_asm!(
                "mov rdi, r13",
                "push 0",
                "jmp r12",
            );
        }

        /// Switch from the current thread to `to`.
        ///
        /// The caller must not hold the run-queue lock across this call.
        ///
        /// # Safety
        ///
        /// Both contexts must be valid; `to` must have been initialized
        /// by [`Context::init`] or saved by a previous switch.
        #[unsafe(naked)]
        pub unsafe extern "C" fn switch(from: *mut Context, to: *const Context) {
            core::arch::naked_asm!(
                "push rbp",
                "push rbx",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "pushfq",
                "mov [rdi], rsp",
                "mov rsp, [rsi]",
                "popfq",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbx",
                "pop rbp",
                "ret",
            );
        }
    } else {
        impl Context {
            /// Host stand-in for [`Context::init`]; records the stack
            /// top so bookkeeping stays observable in tests.
            ///
            /// # Safety
            ///
            /// `stack_top` must point into memory owned by the caller.
            pub unsafe fn init(
                &mut self,
                stack_top: *mut u8,
                _entry: extern "C" fn(usize) -> !,
                _arg: usize,
            ) {
                self.rsp = stack_top as u64 - (SWITCH_FRAME_WORDS * 8) as u64;
            }
        }

        /// Host stand-in; never actually transfers control.
        ///
        /// # Safety
        ///
        /// See the bare-metal variant.
        pub unsafe fn switch(_from: *mut Context, _to: *const Context) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy_entry(_arg: usize) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn test_context_init_reserves_frame() {
        let mut stack = std::vec![0u8; 4096];
        let top = unsafe { stack.as_mut_ptr().add(4096) };
        let mut ctx = Context::empty();
        unsafe { ctx.init(top, dummy_entry, 7) };
        assert_eq!(
            ctx.stack_pointer(),
            top as u64 - (SWITCH_FRAME_WORDS * 8) as u64
        );
    }
}
