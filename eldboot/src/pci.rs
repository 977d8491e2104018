// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Port-mapped PCI configuration access and the bus walk.

use core::arch::asm;

use eldcore::pci::{CFG_ADDR_PORT, CFG_DATA_PORT, CfgSpace, Locn, cfg_addr};
use log::warn;

/// Mechanism #1 accessor over the 0xCF8/0xCFC port pair.
pub struct PortCfg;

impl CfgSpace for PortCfg {
    fn read32(&mut self, locn: Locn, off: u16) -> u32 {
        let addr = cfg_addr(locn, off);
        unsafe {
            asm!("out dx, eax", in("dx") CFG_ADDR_PORT, in("eax") addr);
            let v: u32;
            asm!("in eax, dx", out("eax") v, in("dx") CFG_DATA_PORT);
            v
        }
    }
    fn write32(&mut self, locn: Locn, off: u16, val: u32) {
        let addr = cfg_addr(locn, off);
        unsafe {
            asm!("out dx, eax", in("dx") CFG_ADDR_PORT, in("eax") addr);
            asm!("out dx, eax", in("dx") CFG_DATA_PORT, in("eax") val);
        }
    }
}

const VND_NONE: u32 = 0xFFFF;

/// Depth-first walk from bus 0. Each present function is reported with its
/// id dword and 24-bit class/interface; bridges are followed through their
/// secondary bus, multi-function devices through the header-type flag.
pub fn scan<C: CfgSpace>(cfg: &mut C, visit: &mut dyn FnMut(Locn, u32, u32)) {
    scan_bus(cfg, 0, 0, visit);
}

fn scan_bus<C: CfgSpace>(cfg: &mut C, bus: u8, depth: u8, visit: &mut dyn FnMut(Locn, u32, u32)) {
    if depth > 8 {
        warn!("pci: bridge chain past bus {bus} is too deep, stopping");
        return;
    }
    for dev in 0..32 {
        let l0 = Locn::new(0, bus, dev, 0);
        let id0 = cfg.read32(l0, 0);
        if id0 & 0xFFFF == VND_NONE {
            continue;
        }
        let fns = if cfg.read8(l0, 0x0E) & 0x80 != 0 { 8 } else { 1 };
        for func in 0..fns {
            let locn = Locn::new(0, bus, dev, func);
            let id = if func == 0 { id0 } else { cfg.read32(locn, 0) };
            if id & 0xFFFF == VND_NONE {
                continue;
            }
            let class_if = cfg.read32(locn, 8) >> 8;
            visit(locn, id, class_if);
            // PCI-to-PCI bridge: descend into the secondary bus
            if class_if >> 8 == 0x0604 {
                let secondary = cfg.read8(locn, 0x19);
                scan_bus(cfg, secondary, depth + 1, visit);
            }
        }
    }
}
