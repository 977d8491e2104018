// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! 32→64 bit entry climb.
//!
//! Stage 1 jumps here in 32-bit protected mode with paging off: EAX holds
//! the base memory size in KiB, EDX the temporary EBDA segment, ECX the
//! trampoline stack top (already loaded into ESP) and EBX the
//! boot-parameter list head. The climb builds a static identity map of
//! the low 4 GiB out of 2 MiB pages, turns long mode back on and calls
//! `stage2_main` on its own stack with the four registers marshalled into
//! the SysV argument order.
//!
//! CR4.PAE, CR3, EFER.LME, then CR0.PG, in that order; the far return
//! through the in-image GDT lands in a 64-bit code segment.

use core::arch::global_asm;

global_asm!(
    r#"
    .section .text, "ax"
    .balign 16
    .global _start
    .code32
_start:
    cld
    mov     esi, eax
    mov     edi, edx
    mov     ebp, ebx

    # PML4[0] -> PDPT
    lea     eax, [BOOT_PDPT]
    or      eax, 3
    mov     dword ptr [BOOT_PML4], eax
    mov     dword ptr [BOOT_PML4 + 4], 0

    # PDPT[0..4] -> one page directory per GiB
    xor     ecx, ecx
1:
    mov     eax, ecx
    shl     eax, 12
    lea     edx, [BOOT_PD]
    add     eax, edx
    or      eax, 3
    mov     dword ptr [BOOT_PDPT + ecx*8], eax
    mov     dword ptr [BOOT_PDPT + ecx*8 + 4], 0
    inc     ecx
    cmp     ecx, 4
    jb      1b

    # 2048 present+writable 2 MiB mappings cover the low 4 GiB
    xor     ecx, ecx
2:
    mov     eax, ecx
    shl     eax, 21
    or      eax, 0x83
    mov     dword ptr [BOOT_PD + ecx*8], eax
    mov     dword ptr [BOOT_PD + ecx*8 + 4], 0
    inc     ecx
    cmp     ecx, 2048
    jb      2b

    mov     eax, cr4
    or      eax, 0x20
    mov     cr4, eax
    lea     eax, [BOOT_PML4]
    mov     cr3, eax
    mov     ecx, 0xC0000080
    rdmsr
    or      eax, 0x100
    wrmsr
    lgdt    [BOOT_GDTR]
    mov     eax, cr0
    or      eax, 0x80000001
    mov     cr0, eax
    lea     eax, [.Lentry64]
    push    0x08
    push    eax
    retf
    .code64
.Lentry64:
    mov     ax, 0x10
    mov     ss, ax
    mov     ds, ax
    mov     es, ax
    mov     fs, ax
    mov     gs, ax
    # SysV marshalling: EDI=base KiB, ESI=EBDA seg, EDX=trampoline stack,
    # ECX=bparm head; 32-bit writes zero-extend the parked values.
    mov     edx, esp
    xchg    esi, edi
    mov     ecx, ebp
    lea     rsp, [rip + BOOT_STACK_TOP]
    and     rsp, -16
    call    stage2_main
3:
    cli
    hlt
    jmp     3b

    .section .rodata
    .balign 8
BOOT_GDT:
    .quad   0
    .quad   0x00AF9A000000FFFF
    .quad   0x00CF92000000FFFF
BOOT_GDTR:
    .word   3 * 8 - 1
    .long   BOOT_GDT

    .section .bss
    .balign 4096
BOOT_PML4:
    .skip   4096
BOOT_PDPT:
    .skip   4096
BOOT_PD:
    .skip   4096 * 4
BOOT_STACK:
    .skip   64 * 1024
BOOT_STACK_TOP:

    .section .text, "ax"
    .code64
"#
);
