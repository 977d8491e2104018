// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! 64→32 bit drop trampoline.
//!
//! One page below 4 GiB carries everything the mode switch needs once boot
//! services are gone: the code blob at the page start, the handoff
//! parameter block, a flat 32-bit GDT and its descriptor near the page
//! end. The blob runs with RDI = page base, loads the in-page GDT, far-
//! returns into a 32-bit code segment, turns paging and long mode off and
//! jumps to the stage-2 entry with the handoff registers loaded.

use core::arch::{asm, global_asm};
use core::ptr;

use uefi::Status;

use crate::die;

/// Handoff register block, in the order the blob reads it.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Handoff {
    /// EAX: base memory size in KiB.
    pub base_kib: u32,
    /// EDX: temporary EBDA segment.
    pub ebda_seg: u32,
    /// ECX: stack top, inside this page.
    pub stack: u32,
    /// EBX: boot-parameter list head.
    pub bparm_head: u32,
    /// Entry point, consumed by the blob itself.
    pub entry: u32,
}

/// The stack grows down from the parameter block; the gap above the blob
/// is plenty for the few pushes stage 2 makes before it takes over.
pub const STACK_OFF: u64 = 0xF80;
const PARAMS_OFF: u64 = 0xF80;
const GDT_OFF: u64 = 0xFA0;
const GDTR_OFF: u64 = 0xFB8;

const GDT_CODE32: u64 = 0x00CF_9A00_0000_FFFF;
const GDT_DATA32: u64 = 0x00CF_9200_0000_FFFF;

// Runs copied to the trampoline page, never in place: all addressing is
// relative to RDI/EDI. Leaving long mode follows the architectural order,
// compatibility-mode CS first, then CR0.PG, then EFER.LME.
global_asm!(
    r#"
    .balign 16
    .global eldboot_tramp_start
    .global eldboot_tramp_end
eldboot_tramp_start:
    lgdt    [rdi + 0xFB8]
    .att_syntax prefix
    leaq    (.Leldboot_tramp32 - eldboot_tramp_start)(%rdi), %rax
    .intel_syntax noprefix
    push    0x08
    push    rax
    retfq
    .code32
.Leldboot_tramp32:
    mov     eax, cr0
    and     eax, 0x7FFFFFFF
    mov     cr0, eax
    mov     ecx, 0xC0000080
    rdmsr
    and     eax, 0xFFFFFEFF
    wrmsr
    mov     ax, 0x10
    mov     ds, ax
    mov     es, ax
    mov     fs, ax
    mov     gs, ax
    mov     ss, ax
    mov     esp, dword ptr [edi + 0xF88]
    mov     eax, dword ptr [edi + 0xF80]
    mov     edx, dword ptr [edi + 0xF84]
    mov     ecx, dword ptr [edi + 0xF88]
    mov     ebx, dword ptr [edi + 0xF8C]
    mov     esi, dword ptr [edi + 0xF90]
    jmp     esi
eldboot_tramp_end:
    .code64
"#
);

unsafe extern "C" {
    static eldboot_tramp_start: u8;
    static eldboot_tramp_end: u8;
}

/// Copy the blob into the page and lay out GDT, GDTR and parameters.
pub fn install(page: u64, h: &Handoff) {
    let start = unsafe { ptr::addr_of!(eldboot_tramp_start) } as usize;
    let end = unsafe { ptr::addr_of!(eldboot_tramp_end) } as usize;
    let len = end - start;
    if len as u64 > PARAMS_OFF {
        die(
            Status::LOAD_ERROR,
            &format_args!("trampoline blob is {len} bytes"),
        );
    }
    unsafe {
        ptr::copy_nonoverlapping(start as *const u8, page as *mut u8, len);
        let gdt = (page + GDT_OFF) as *mut u64;
        gdt.write(0);
        gdt.add(1).write(GDT_CODE32);
        gdt.add(2).write(GDT_DATA32);
        ((page + GDTR_OFF) as *mut u16).write(3 * 8 - 1);
        ((page + GDTR_OFF + 2) as *mut u64).write_unaligned(page + GDT_OFF);
        ((page + PARAMS_OFF) as *mut Handoff).write(*h);
    }
}

/// Jump into the installed page. Boot services must already be gone.
pub unsafe fn enter(page: u64) -> ! {
    unsafe {
        // page base rides in rdi; the blob addresses everything off it
        asm!(
            "cli",
            "jmp {entry}",
            entry = in(reg) page,
            in("rdi") page,
            options(noreturn),
        );
    }
}
