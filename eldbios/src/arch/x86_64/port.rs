// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Port I/O backends for the eldcore hardware traits.

use eldcore::hw::PortIo;
use eldcore::pci::{CFG_ADDR_PORT, CFG_DATA_PORT, CfgSpace, Locn, cfg_addr};
use x86_64::instructions::port::Port;

/// Plain byte-wide port access.
pub struct Ports;

impl PortIo for Ports {
    fn outb(&mut self, port: u16, val: u8) {
        unsafe { Port::new(port).write(val) }
    }

    fn inb(&mut self, port: u16) -> u8 {
        unsafe { Port::new(port).read() }
    }
}

/// PCI configuration mechanism #1 through 0xCF8/0xCFC.
pub struct PortCfg;

impl CfgSpace for PortCfg {
    fn read32(&mut self, locn: Locn, off: u16) -> u32 {
        unsafe {
            Port::new(CFG_ADDR_PORT).write(cfg_addr(locn, off));
            Port::new(CFG_DATA_PORT).read()
        }
    }

    fn write32(&mut self, locn: Locn, off: u16, val: u32) {
        unsafe {
            Port::new(CFG_ADDR_PORT).write(cfg_addr(locn, off));
            Port::new(CFG_DATA_PORT).write(val)
        }
    }
}
