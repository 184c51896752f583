//! # AP Trampoline Blob
//!
//! The 16-bit entry stream every AP executes out of the STARTUP vector:
//! real mode → protected mode → long mode, then stack, argument, and
//! entry point are taken from the mailbox cell and control leaves the
//! blob. The code is assembled for the fixed trampoline page at 0x8000;
//! `orion_ap_trampoline_start`/`_end` delimit the bytes to copy there.
//!
//! Bare-metal only: the page and the privileged transitions do not
//! exist off-metal.

use super::startup::{mailbox, AP_TRAMPOLINE_ADDR, MAILBOX_OFFSET};

extern "C" {
    static orion_ap_trampoline_start: u8;
    static orion_ap_trampoline_end: u8;
}

/// The trampoline bytes to copy below 1 MiB.
pub fn blob() -> &'static [u8] {
    unsafe {
        let start = &orion_ap_trampoline_start as *const u8;
        let end = &orion_ap_trampoline_end as *const u8;
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}

// Absolute addresses of the mailbox fields as seen by the blob.
const MB_STACK: u64 = AP_TRAMPOLINE_ADDR + MAILBOX_OFFSET + mailbox::STACK_TOP;
const MB_CR3: u64 = AP_TRAMPOLINE_ADDR + MAILBOX_OFFSET + mailbox::CR3;
const MB_ENTRY: u64 = AP_TRAMPOLINE_ADDR + MAILBOX_OFFSET + mailbox::ENTRY;
const MB_CPU_ID: u64 = AP_TRAMPOLINE_ADDR + MAILBOX_OFFSET + mailbox::CPU_ID;

core::arch::global_asm!(
    r#"
    .pushsection .text.orion_ap_trampoline, "ax"
    .global orion_ap_trampoline_start
    .global orion_ap_trampoline_end

    .code16
orion_ap_trampoline_start:
    cli
    cld
    xor ax, ax
    mov ds, ax

    // Blob-embedded GDT, already at its copied location.
    lgdt [{base} + (2f - orion_ap_trampoline_start)]

    // Protected mode.
    mov eax, cr0
    or eax, 1
    mov cr0, eax

    // Far jump into the 32-bit code segment (EA ptr16:16).
    .byte 0xEA
    .word {base} + (3f - orion_ap_trampoline_start)
    .word 0x08

    .code32
3:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax

    // PAE.
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax

    // Kernel page tables from the mailbox.
    mov eax, [{mb_cr3}]
    mov cr3, eax

    // Long mode enable.
    mov ecx, 0xC0000080
    rdmsr
    or eax, 1 << 8
    wrmsr

    // Paging on; long mode becomes active.
    mov eax, cr0
    or eax, 1 << 31
    mov cr0, eax

    // Far jump into the 64-bit code segment (EA ptr16:32).
    .byte 0xEA
    .long {base} + (4f - orion_ap_trampoline_start)
    .word 0x18

    .code64
4:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax

    // Stack, logical id, entry point from the mailbox.
    mov rsp, [{mb_stack}]
    mov edi, [{mb_cpu_id}]
    mov rax, [{mb_entry}]
    jmp rax

    .balign 16
1:  // GDT: null, 32-bit code, data, 64-bit code.
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
    .quad 0x00AF9A000000FFFF
2:  // GDT pointer.
    .word (2b - 1b) - 1
    .long {base} + (1b - orion_ap_trampoline_start)

orion_ap_trampoline_end:
    .popsection
    "#,
    base = const AP_TRAMPOLINE_ADDR,
    mb_stack = const MB_STACK,
    mb_cr3 = const MB_CR3,
    mb_entry = const MB_ENTRY,
    mb_cpu_id = const MB_CPU_ID,
);
