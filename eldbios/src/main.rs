// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Stage 2: entered in 32-bit protected mode with the boot-parameter
//! list in hand, climbs back to long mode and rebuilds the legacy PC
//! environment the firmware never provided.

#![no_std]
#![no_main]

extern crate alloc;

mod bda;
mod entry32;
mod irq;
mod mem;
mod time;
mod usb;
mod arch {
    pub mod x86_64 {
        pub mod ioapic;
        pub mod port;
        pub mod rm16;
        pub mod serial;
    }
}

use core::panic::PanicInfo;

use crate::arch::x86_64::rm16;
use log::info;

/// Register file handed over by stage 1, in the order the entry
/// assembly marshals it: EAX, EDX, ECX, EBX.
#[unsafe(no_mangle)]
pub extern "C" fn stage2_main(
    base_kib: u32,
    ebda_seg: u32,
    tramp_stack: u32,
    bparm_head: u32,
) -> ! {
    x86_64::instructions::interrupts::disable();
    unsafe {
        crate::arch::x86_64::serial::init_com1(115_200);
    }
    crate::arch::x86_64::serial::init_log();
    println!(">>> Eldbios stage 2 v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "base {} KiB, EBDA at {:#06x}:0, trampoline stack {:#010x}, parameters at {:#010x}",
        base_kib, ebda_seg, tramp_stack, bparm_head
    );

    mem::init(bparm_head as u64);
    bda::init(base_kib, ebda_seg as u16);
    unsafe {
        rm16::init();
    }
    irq::init(bparm_head as u64);
    time::init();
    usb::init(bparm_head as u64);

    let sum = unsafe { rm16::call(1, 2, 3, 4, rm16::smoke_target()) };
    if sum != 10 {
        panic!("16-bit call gate smoke test returned {sum}");
    }
    info!("16-bit call gate up");

    println!("system halted");
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::println!("\n*** STAGE 2 PANIC ***\n{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
