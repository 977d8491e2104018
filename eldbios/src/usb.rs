// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Take USB controllers away from the firmware.
//!
//! EHCI keeps its legacy-support capability in PCI config space, XHCI
//! in MMIO off the capability registers; both end in the same
//! BIOS/OS-semaphore handshake. Runs before any 16-bit code so SMM
//! keyboard emulation is gone by the time the real-mode side starts
//! touching the i8042.

use crate::arch::x86_64::port::PortCfg;
use core::ptr;
use eldcore::bparm::{BP_PCID, PciDev, Records};
use eldcore::pci::{CfgSpace, Locn};
use eldcore::usb::{self, LegacyRegs};
use log::{info, warn};

/// class 0x0C, subclass 0x03, prog-if 0x20/0x30.
const CIF_EHCI: u32 = 0x0C0320;
const CIF_XHCI: u32 = 0x0C0330;

pub fn init(bparm_head: u64) {
    let mut cfg = PortCfg;
    for rec in unsafe { Records::new(bparm_head) } {
        if rec.tag() != BP_PCID {
            continue;
        }
        let Some(dev) = (unsafe { rec.payload::<PciDev>() }) else {
            continue;
        };
        let locn = Locn::from_raw(dev.pci_locn);
        match dev.class_if {
            CIF_EHCI => ehci(&mut cfg, locn),
            CIF_XHCI => xhci(&mut cfg, locn),
            _ => {}
        }
    }
}

/// BAR0 as a physical MMIO address, or `None` for an I/O BAR or an
/// unassigned one. 64-bit BARs take their high half from the next slot.
fn bar0(cfg: &mut PortCfg, locn: Locn) -> Option<u64> {
    let lo = cfg.read32(locn, 0x10);
    if lo & 1 != 0 {
        return None;
    }
    let mut pa = (lo & !0xF) as u64;
    if lo & 0x6 == 0x4 {
        pa |= (cfg.read32(locn, 0x14) as u64) << 32;
    }
    (pa != 0).then_some(pa)
}

/// The identity map stops at 4 GiB; a BAR above it is out of reach.
fn mapped(pa: u64, len: u64) -> bool {
    pa.checked_add(len).is_some_and(|end| end <= 1 << 32)
}

fn ehci(cfg: &mut PortCfg, locn: Locn) {
    let Some(pa) = bar0(cfg, locn) else {
        warn!("usb: EHCI {locn} has no usable BAR0");
        return;
    };
    if !mapped(pa, 0x20) {
        warn!("usb: EHCI {locn} capability registers above 4 GiB");
        return;
    }
    let hccparams = unsafe { ptr::read_volatile((pa as usize + 8) as *const u32) };
    let outcome = usb::ehci_take_ownership(cfg, locn, hccparams, None);
    info!("usb: EHCI {locn}: {outcome:?}");
}

fn xhci(cfg: &mut PortCfg, locn: Locn) {
    let Some(pa) = bar0(cfg, locn) else {
        warn!("usb: XHCI {locn} has no usable BAR0");
        return;
    };
    if !mapped(pa, 0x20) {
        warn!("usb: XHCI {locn} capability registers above 4 GiB");
        return;
    }
    let hccparams1 = unsafe { ptr::read_volatile((pa as usize + 0x10) as *const u32) };
    let outcome = usb::xhci_take_ownership(MmioWindow::open, pa, hccparams1, None);
    info!("usb: XHCI {locn}: {outcome:?}");
}

/// One extended-capability entry's dword pair, reached through the
/// identity map.
struct MmioWindow {
    base: *mut u32,
}

impl MmioWindow {
    fn open(pa: u64) -> Option<Self> {
        if pa == 0 || !mapped(pa, 8) {
            return None;
        }
        Some(Self {
            base: pa as *mut u32,
        })
    }
}

impl LegacyRegs for MmioWindow {
    fn read(&mut self, dword: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base.add(dword)) }
    }

    fn write(&mut self, dword: usize, val: u32) {
        unsafe { ptr::write_volatile(self.base.add(dword), val) }
    }
}
