// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Synchronous 16-bit call gate.
//!
//! One page below 1 MiB holds everything the round trip needs: the mode
//! drop/climb blob at the page start, a resident smoke-test routine, the
//! per-call register file and result slots, a GDT with both flat and
//! stub-based segments, and a 16-bit stack. `call` drops from long mode
//! through protected 16-bit into real mode, far-calls the callee with
//! EAX/EDX/ECX/EBX loaded from the slots, and climbs back the way it
//! came. Interrupts stay disabled for the whole trip; the 8259s only
//! deliver once 16-bit code runs under a live IVT.
//!
//! Selector layout is shared with the entry climb: 0x08 is always 64-bit
//! code and 0x10 flat data, in the stub GDT and the boot GDT both, so
//! swapping GDTs never strands a cached selector.

use core::arch::global_asm;
use core::mem;
use core::ptr;

use alloc::boxed::Box;
use log::info;
use spin::Once;
use x86_64::instructions::tables::sgdt;

/// `seg << 16 | off` real-mode far pointer.
pub type FarPtr16 = u32;

pub const fn mk_fp16(seg: u16, off: u16) -> FarPtr16 {
    (seg as u32) << 16 | off as u32
}

// Stub page layout. The blob sits at the page start; the 16-bit stack
// grows down from ARGS_OFF, so the blob must stay well short of it. The
// saved RSP slot at 0xE20 belongs to the blob alone.
const ARGS_OFF: usize = 0xE00;
const CALLEE_OFF: usize = 0xE10;
const RET_OFF: usize = 0xE14;
const BASE_OFF: usize = 0xE18;
const SAVED_GDTR_OFF: usize = 0xE28;
const SEG_OFF: usize = 0xE32;
const GDT_OFF: usize = 0xF00;
const GDTR_OFF: usize = 0xF40;
const BLOB_MAX: usize = 0xC00;

const SEL_CODE64: u16 = 0x08;
const SEL_DATA32: u16 = 0x10;
const SEL_CODE32: u16 = 0x18;
const SEL_CODE16: u16 = 0x20;
const SEL_DATA16: u16 = 0x28;
const SEL_CODE32_STUB: u16 = 0x30;

const GDT_CODE64: u64 = 0x00AF_9A00_0000_FFFF;
const GDT_DATA32: u64 = 0x00CF_9200_0000_FFFF;
const GDT_CODE32: u64 = 0x00CF_9A00_0000_FFFF;

/// 64 KiB byte-granular descriptor based at the stub page.
const fn stub_desc(base: u32, access: u8, flags: u8) -> u64 {
    let base = base as u64;
    0xFFFF
        | (base & 0xFFFF) << 16
        | (base >> 16 & 0xFF) << 32
        | (access as u64) << 40
        | (flags as u64 & 0xF) << 52
        | (base >> 24) << 56
}

// The round trip. Runs from a copy in the stub page; every control
// transfer is a push/retf pair so nothing needs link-time relocation.
// Mode changes follow the architectural order both ways: PG off before
// LME off on the way down, LME on before PG on the way up. The caller's
// stack must sit below 4 GiB, since the 32-bit leg keeps using its low
// half until the stub stack takes over.
global_asm!(
    r#"
    .balign 16
    .global eldbios_rm16_start
    .global eldbios_rm16_smoke
    .global eldbios_rm16_end
eldbios_rm16_start:
    push    rbx
    push    rbp
    push    r12
    push    r13
    push    r14
    push    r15
    mov     [rdi + 0xE20], rsp
    lgdt    [rdi + 0xF40]
    .att_syntax prefix
    leaq    (.Lrm16_drop32 - eldbios_rm16_start)(%rdi), %rax
    .intel_syntax noprefix
    push    0x18
    push    rax
    retfq
    .code32
.Lrm16_drop32:
    mov     eax, cr0
    and     eax, 0x7FFFFFFF
    mov     cr0, eax
    mov     ecx, 0xC0000080
    rdmsr
    and     eax, 0xFFFFFEFF
    wrmsr
    push    0x20
    .att_syntax prefix
    pushl   $(.Lrm16_pm16 - eldbios_rm16_start)
    .intel_syntax noprefix
    retf
    .code16
.Lrm16_pm16:
    mov     ax, 0x28
    mov     ss, ax
    mov     sp, 0xE00
    mov     ds, ax
    mov     ax, [0xE32]
    push    ax
    .att_syntax prefix
    movw    $(.Lrm16_real - eldbios_rm16_start), %ax
    .intel_syntax noprefix
    push    ax
    mov     ebx, cr0
    and     bl, 0xFE
    mov     cr0, ebx
    retf
.Lrm16_real:
    mov     ax, cs
    mov     ds, ax
    mov     es, ax
    mov     ss, ax
    push    cs
    .att_syntax prefix
    movw    $(.Lrm16_back - eldbios_rm16_start), %ax
    .intel_syntax noprefix
    push    ax
    push    word ptr [0xE12]
    push    word ptr [0xE10]
    mov     eax, [0xE00]
    mov     edx, [0xE04]
    mov     ecx, [0xE08]
    mov     ebx, [0xE0C]
    retf
.Lrm16_back:
    mov     bx, cs
    mov     ds, bx
    jnc     1f
    neg     eax
    jnz     1f
    dec     eax
1:
    mov     [0xE14], eax
    mov     ebx, cr0
    or      bl, 1
    mov     cr0, ebx
    mov     ax, 0x30
    push    ax
    .att_syntax prefix
    movw    $(.Lrm16_climb32 - eldbios_rm16_start), %ax
    .intel_syntax noprefix
    push    ax
    retf
    .code32
.Lrm16_climb32:
    mov     ax, 0x10
    mov     ds, ax
    mov     edi, dword ptr cs:[0xE18]
    mov     ecx, 0xC0000080
    rdmsr
    or      eax, 0x100
    wrmsr
    mov     eax, cr0
    or      eax, 0x80000000
    mov     cr0, eax
    .att_syntax prefix
    leal    (.Lrm16_back64 - eldbios_rm16_start)(%edi), %eax
    .intel_syntax noprefix
    push    0x08
    push    eax
    retf
    .code64
.Lrm16_back64:
    mov     edi, edi
    mov     rsp, [rdi + 0xE20]
    mov     ax, 0x10
    mov     ss, ax
    mov     ds, ax
    mov     es, ax
    mov     fs, ax
    mov     gs, ax
    lgdt    [rdi + 0xE28]
    mov     eax, dword ptr [rdi + 0xE14]
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbp
    pop     rbx
    ret
    .code16
eldbios_rm16_smoke:
    add     eax, edx
    add     eax, ecx
    add     eax, ebx
    clc
    retf
eldbios_rm16_end:
    .code64
"#
);

unsafe extern "C" {
    static eldbios_rm16_start: u8;
    static eldbios_rm16_smoke: u8;
    static eldbios_rm16_end: u8;
}

#[repr(C, align(4096))]
struct StubPage([u8; 4096]);

struct Gate {
    base: usize,
    seg: u16,
    smoke_off: u16,
}

static GATE: Once<Gate> = Once::new();

/// Copy the resident stub into low memory and lay out its GDT and slots.
///
/// # Safety
/// The heap must already cover base memory below 1 MiB, and nothing may
/// be executing 16-bit code yet.
pub unsafe fn init() {
    let start = unsafe { ptr::addr_of!(eldbios_rm16_start) } as usize;
    let smoke = unsafe { ptr::addr_of!(eldbios_rm16_smoke) } as usize;
    let end = unsafe { ptr::addr_of!(eldbios_rm16_end) } as usize;
    let len = end - start;
    if len > BLOB_MAX {
        panic!("16-bit stub blob is {len} bytes");
    }

    let page: &'static mut StubPage = Box::leak(Box::new(StubPage([0; 4096])));
    let base = page as *mut StubPage as usize;
    if base + 4096 > 0x10_0000 {
        panic!("16-bit stub landed at {base:#x}, above the real-mode horizon");
    }
    let seg = (base >> 4) as u16;

    unsafe {
        ptr::copy_nonoverlapping(start as *const u8, base as *mut u8, len);

        let gdt = (base + GDT_OFF) as *mut u64;
        gdt.write(0);
        gdt.add((SEL_CODE64 / 8) as usize).write(GDT_CODE64);
        gdt.add((SEL_DATA32 / 8) as usize).write(GDT_DATA32);
        gdt.add((SEL_CODE32 / 8) as usize).write(GDT_CODE32);
        gdt.add((SEL_CODE16 / 8) as usize)
            .write(stub_desc(base as u32, 0x9A, 0x0));
        gdt.add((SEL_DATA16 / 8) as usize)
            .write(stub_desc(base as u32, 0x92, 0x0));
        gdt.add((SEL_CODE32_STUB / 8) as usize)
            .write(stub_desc(base as u32, 0x9A, 0x4));
        ((base + GDTR_OFF) as *mut u16).write(7 * 8 - 1);
        ((base + GDTR_OFF + 2) as *mut u64).write_unaligned((base + GDT_OFF) as u64);

        let boot_gdtr = sgdt();
        ((base + SAVED_GDTR_OFF) as *mut u16).write(boot_gdtr.limit);
        ((base + SAVED_GDTR_OFF + 2) as *mut u64).write_unaligned(boot_gdtr.base.as_u64());

        ((base + BASE_OFF) as *mut u32).write(base as u32);
        ((base + SEG_OFF) as *mut u16).write(seg);
    }

    GATE.call_once(|| Gate {
        base,
        seg,
        smoke_off: (smoke - start) as u16,
    });
    info!("rm16: resident stub at {base:#07x} ({len} bytes), segment {seg:#06x}");
}

/// Far pointer to the stub's own smoke-test routine, which sums the four
/// register arguments and returns with carry clear.
pub fn smoke_target() -> FarPtr16 {
    match GATE.get() {
        Some(g) => mk_fp16(g.seg, g.smoke_off),
        None => panic!("16-bit call gate used before init"),
    }
}

/// Drop to real mode, far-call `callee` with the given register file,
/// climb back. Returns the callee's EAX; carry set on return negates it
/// (-1 when EAX was zero).
///
/// # Safety
/// `callee` must point at real-mode code below 1 MiB that returns by
/// `retf` with the stack balanced.
pub unsafe fn call(eax: u32, edx: u32, ecx: u32, ebx: u32, callee: FarPtr16) -> i32 {
    let Some(gate) = GATE.get() else {
        panic!("16-bit call gate used before init");
    };
    unsafe {
        let args = (gate.base + ARGS_OFF) as *mut u32;
        args.write(eax);
        args.add(1).write(edx);
        args.add(2).write(ecx);
        args.add(3).write(ebx);
        ((gate.base + CALLEE_OFF) as *mut u32).write(callee);
        ((gate.base + RET_OFF) as *mut u32).write(0);

        let enter: unsafe extern "sysv64" fn(u64) -> i32 = mem::transmute(gate.base);
        enter(gate.base as u64)
    }
}
