//! # Cross-CPU Function Calls
//!
//! One global in-flight call slot: the initiator publishes a function
//! pointer and argument, raises the call-function IPI, and (optionally)
//! spins until every target decremented the pending counter. The global
//! call lock is held across the whole operation, so there is never more
//! than one call in flight.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::cpu_info;
use super::per_cpu;
use crate::arch::x86_64::apic::ipi;
use crate::sync::TicketLock;

/// Cross-call function signature.
pub type CallFn = fn(usize);

/// Serializes initiators; the slot holds one call at a time.
static CALL_LOCK: TicketLock<()> = TicketLock::new(());

/// Published function pointer (0 = none).
static CALL_FUNC: AtomicUsize = AtomicUsize::new(0);

/// Published argument.
static CALL_ARG: AtomicUsize = AtomicUsize::new(0);

/// Targets that have not run the call yet.
static CALL_PENDING: AtomicU32 = AtomicU32::new(0);

/// Run `func(arg)` on every online CPU, including the caller.
///
/// With `wait` the initiator spins until all remote targets finished.
pub fn call_function_all(func: CallFn, arg: usize, wait: bool) {
    let _slot = CALL_LOCK.lock();

    let self_cpu = per_cpu::current_cpu_id() as usize;
    let mut targets = 0u32;
    super::for_each_online_cpu(|cpu| {
        if cpu != self_cpu {
            targets += 1;
        }
    });

    CALL_FUNC.store(func as usize, Ordering::SeqCst);
    CALL_ARG.store(arg, Ordering::SeqCst);
    CALL_PENDING.store(targets, Ordering::SeqCst);

    super::for_each_online_cpu(|cpu| {
        if cpu == self_cpu {
            return;
        }
        if let Some(info) = cpu_info::get_cpu_info(cpu) {
            ipi::send_call_function(info.apic_id());
        }
    });

    // The initiator participates directly.
    func(arg);

    // Stubbed sends never retire the slot off-metal.
    #[cfg(not(target_os = "none"))]
    CALL_PENDING.store(0, Ordering::SeqCst);

    if wait {
        while CALL_PENDING.load(Ordering::Acquire) > 0 {
            crate::arch::pause();
        }
    }
}

/// Run `func(arg)` on one specific CPU.
pub fn call_function_single(cpu_id: usize, func: CallFn, arg: usize, wait: bool) {
    let _slot = CALL_LOCK.lock();

    if cpu_id == per_cpu::current_cpu_id() as usize {
        func(arg);
        return;
    }

    let Some(info) = cpu_info::get_cpu_info(cpu_id) else {
        return;
    };

    CALL_FUNC.store(func as usize, Ordering::SeqCst);
    CALL_ARG.store(arg, Ordering::SeqCst);
    CALL_PENDING.store(1, Ordering::SeqCst);

    ipi::send_call_function(info.apic_id());

    // Stubbed sends never retire the slot off-metal.
    #[cfg(not(target_os = "none"))]
    CALL_PENDING.store(0, Ordering::SeqCst);

    if wait {
        while CALL_PENDING.load(Ordering::Acquire) > 0 {
            crate::arch::pause();
        }
    }
}

/// Call-function IPI handler body: run the published call and retire
/// one pending slot. The interrupt entry path is responsible for EOI.
pub fn handle_call_ipi() {
    ipi::note_received();
    let func = CALL_FUNC.load(Ordering::Acquire);
    if func != 0 {
        let func: CallFn = unsafe { core::mem::transmute::<usize, CallFn>(func) };
        func(CALL_ARG.load(Ordering::Acquire));
    }
    CALL_PENDING.fetch_sub(1, Ordering::AcqRel);
}

/// TLB-flush IPI handler body: reload the address-space root.
pub fn handle_tlb_flush_ipi() {
    ipi::note_received();
    cfg_if::cfg_if! {
        if #[cfg(target_os = "none")] {
            unsafe {
                core::arch::asm!(
                    "mov rax, cr3",
                    "mov cr3, rax",
                    out("rax") _,
                    options(nostack, preserves_flags),
                );
            }
        }
    }
}

/// Stop IPI handler body: mark the CPU halted and park it. Reserved for
/// emergency system-wide shutdown.
pub fn handle_stop_ipi() -> ! {
    ipi::note_received();
    let area = per_cpu::current_percpu();
    area.set_flag(per_cpu::PerCpuFlags::HALTED);
    if let Some(info) = cpu_info::get_cpu_info(area.cpu_id() as usize) {
        info.set_state(super::CpuState::Halted);
    }
    crate::arch::x86_64::irq::irq_disable();
    loop {
        crate::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Mutex;

    static HITS: StdAtomicUsize = StdAtomicUsize::new(0);
    static CALL_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn bump(arg: usize) {
        HITS.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn test_call_runs_locally() {
        // Off-metal only the initiator leg runs; remote IPIs are
        // recorded, not delivered.
        let _guard = CALL_TEST_LOCK.lock().unwrap();
        HITS.store(0, Ordering::SeqCst);
        call_function_all(bump, 3, true);
        assert_eq!(HITS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_call_single_self_short_circuits() {
        let _guard = CALL_TEST_LOCK.lock().unwrap();
        HITS.store(0, Ordering::SeqCst);
        let self_cpu = per_cpu::current_cpu_id() as usize;
        call_function_single(self_cpu, bump, 5, true);
        assert_eq!(HITS.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_handle_call_ipi_consumes_slot() {
        let _guard = CALL_TEST_LOCK.lock().unwrap();
        HITS.store(0, Ordering::SeqCst);
        CALL_FUNC.store(bump as CallFn as usize, Ordering::SeqCst);
        CALL_ARG.store(2, Ordering::SeqCst);
        CALL_PENDING.store(1, Ordering::SeqCst);
        handle_call_ipi();
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
        assert_eq!(CALL_PENDING.load(Ordering::SeqCst), 0);
    }
}
