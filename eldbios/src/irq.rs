// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Legacy interrupt plumbing: park the I/O APICs, then bring up the
//! 8259 pair the way 16-bit software expects to find it.
//!
//! Stage 2 itself never executes with interrupts enabled; the
//! controllers are programmed for the benefit of the real-mode side,
//! where the IVT is live and `sti` is legal.

use crate::arch::x86_64::ioapic::MmioIoApic;
use crate::arch::x86_64::port::Ports;
use crate::mem::IdentityMapper;
use eldcore::acpi::{self, AcpiError};
use eldcore::bparm::{BP_RSDP, Records, RsdpDesc};
use eldcore::hw::PortIo;
use log::{info, warn};

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

// ICW1: start init, expect ICW4. ICW4: 8086 mode.
const ICW1_INIT_IC4: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const OCW2_EOI: u8 = 0x20;

/// Vector bases, the traditional ones: IRQ0..7 at 0x08, IRQ8..15 at 0x70.
const PIC1_VEC: u8 = 0x08;
const PIC2_VEC: u8 = 0x70;

/// IRQ0 timer, IRQ1 keyboard, IRQ2 cascade; everything else masked.
const PIC1_UNMASK: u8 = 1 | 1 << 1 | 1 << 2;
/// IRQ8 RTC.
const PIC2_UNMASK: u8 = 1;

pub fn init(bparm_head: u64) {
    let mut rsdp = None;
    for rec in unsafe { Records::new(bparm_head) } {
        if rec.tag() == BP_RSDP {
            rsdp = unsafe { rec.payload::<RsdpDesc>() };
        }
    }
    match rsdp {
        Some(desc) => mask_ioapics(&desc),
        None => warn!("irq: no RSDP record, leaving I/O APICs alone"),
    }
    pic_init();
}

/// Every redirection entry a firmware-armed I/O APIC still carries is a
/// stray interrupt waiting for the real-mode side, so mask them all
/// before the 8259s take over delivery.
fn mask_ioapics(desc: &RsdpDesc) {
    let mapper = IdentityMapper::new();
    match acpi::scan(&mapper, desc.rsdp_addr, desc.rsdp_len, MmioIoApic::open) {
        Ok(report) => {
            if !report.madt_found {
                warn!("irq: ACPI tables carry no MADT");
            } else {
                info!(
                    "irq: masked {} redirection entries on {} I/O APIC(s)",
                    report.masked_entries, report.ioapics
                );
            }
        }
        Err(AcpiError::BadRsdpSignature) => {
            panic!("RSDP record points at garbage");
        }
        Err(AcpiError::MapFailed) => {
            warn!("irq: ACPI table out of reach, I/O APICs left as found");
        }
    }
}

/// Full ICW1..ICW4 bring-up of both 8259s, every write settled through
/// the POST port.
fn pic_init() {
    let mut io = Ports;
    io.outb_wait(PIC1_CMD, ICW1_INIT_IC4);
    io.outb_wait(PIC2_CMD, ICW1_INIT_IC4);
    io.outb_wait(PIC1_DATA, PIC1_VEC);
    io.outb_wait(PIC2_DATA, PIC2_VEC);
    io.outb_wait(PIC1_DATA, 1 << 2);
    io.outb_wait(PIC2_DATA, 1 << 1);
    io.outb_wait(PIC1_DATA, ICW4_8086);
    io.outb_wait(PIC2_DATA, ICW4_8086);
    io.outb_wait(PIC1_DATA, !PIC1_UNMASK);
    io.outb_wait(PIC2_DATA, !PIC2_UNMASK);
    io.outb_wait(PIC1_CMD, OCW2_EOI);
    io.outb_wait(PIC2_CMD, OCW2_EOI);
    info!(
        "irq: 8259 pair at vectors {:#04x}/{:#04x}",
        PIC1_VEC, PIC2_VEC
    );
}
