// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! I/O-APIC register window over the identity map.

use eldcore::acpi::IoApicRegs;

const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

/// Select/window pair of one I/O APIC, reached through the boot
/// identity map.
pub struct MmioIoApic {
    base: *mut u8,
}

impl MmioIoApic {
    /// MADT entries report 32-bit physical addresses, but a corrupt
    /// table could still point outside the mapped 4 GiB window.
    pub fn open(phys: u64) -> Option<Self> {
        if phys == 0 || phys + (IOWIN + 4) as u64 > 1 << 32 {
            return None;
        }
        Some(Self {
            base: phys as *mut u8,
        })
    }
}

impl IoApicRegs for MmioIoApic {
    fn select(&mut self, reg: u32) {
        unsafe { core::ptr::write_volatile(self.base.add(IOREGSEL) as *mut u32, reg) }
    }

    fn window_read(&mut self) -> u32 {
        unsafe { core::ptr::read_volatile(self.base.add(IOWIN) as *const u32) }
    }

    fn window_write(&mut self, val: u32) {
        unsafe { core::ptr::write_volatile(self.base.add(IOWIN) as *mut u32, val) }
    }
}
