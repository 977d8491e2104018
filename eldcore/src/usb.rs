// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! EHCI/XHCI legacy-support ownership handoff.
//!
//! Firmware keeps driving USB controllers through SMM until the OS flags
//! the OS-owned semaphore in the legacy-support capability and the BIOS
//! drops its own. EHCI exposes that capability in PCI config space, XHCI
//! in MMIO past the capability registers; the handshake itself is the same
//! dword either way, so both walks funnel into one claim routine.

use core::num::NonZeroU32;

use bitflags::bitflags;
use log::{debug, warn};

use crate::pci::{CfgSpace, Locn};

bitflags! {
    /// USBLEGSUP semaphore bits; the low half of the dword carries the
    /// capability id and next pointer and must ride along untouched.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LegacySup: u32 {
        const BIOS_OWNED = 1 << 16;
        const OS_OWNED = 1 << 24;
    }
}

/// Dword indices within a legacy-support capability.
pub const USBLEGSUP: usize = 0;
pub const USBLEGCTLSTS: usize = 1;

pub const CAP_ID_LEGACY: u8 = 0x01;

/// EECP values below this are reserved encodings, not offsets.
const EECP_MIN: u16 = 0x40;

/// How a takeover attempt ended. Later variants take precedence when a
/// controller exposes more than one legacy capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    /// No legacy-support capability in the chain.
    NoLegacyCap,
    /// The BIOS-owned semaphore was already clear.
    AlreadyOsOwned,
    /// The BIOS acknowledged and dropped its semaphore.
    Released,
    /// The configured spin bound ran out with the BIOS still holding on.
    TimedOut,
}

/// The two dwords of one legacy-support capability, wherever they live.
pub trait LegacyRegs {
    fn read(&mut self, dword: usize) -> u32;
    fn write(&mut self, dword: usize, val: u32);
}

/// The ownership handshake proper: request OS ownership, then poll until
/// the BIOS lets go. Unbounded when `bound` is `None`; a stuck SMM
/// handler then hangs the boot here rather than continuing with firmware
/// still poking the controller behind our back.
fn claim<R: LegacyRegs + ?Sized>(regs: &mut R, bound: Option<NonZeroU32>) -> Outcome {
    let sup = LegacySup::from_bits_retain(regs.read(USBLEGSUP));
    let ctlsts = regs.read(USBLEGCTLSTS);
    debug!("usb: USBLEGSUP {:#010x} USBLEGCTLSTS {ctlsts:#010x}", sup.bits());
    if !sup.contains(LegacySup::BIOS_OWNED) {
        return Outcome::AlreadyOsOwned;
    }
    regs.write(USBLEGSUP, ((sup | LegacySup::OS_OWNED) - LegacySup::BIOS_OWNED).bits());
    let mut spins = 0u32;
    loop {
        if !LegacySup::from_bits_retain(regs.read(USBLEGSUP)).contains(LegacySup::BIOS_OWNED) {
            return Outcome::Released;
        }
        spins = spins.wrapping_add(1);
        if bound.is_some_and(|b| spins >= b.get()) {
            return Outcome::TimedOut;
        }
    }
}

struct EhciCapRegs<'a, C: CfgSpace + ?Sized> {
    cfg: &'a mut C,
    locn: Locn,
    off: u16,
}

impl<C: CfgSpace + ?Sized> LegacyRegs for EhciCapRegs<'_, C> {
    fn read(&mut self, dword: usize) -> u32 {
        self.cfg.read32(self.locn, self.off + 4 * dword as u16)
    }

    fn write(&mut self, dword: usize, val: u32) {
        self.cfg.write32(self.locn, self.off + 4 * dword as u16, val);
    }
}

/// Walk an EHCI controller's extended-capability chain in config space
/// and take ownership at every legacy-support capability.
///
/// `hccparams` is the capability-register HCCPARAMS value; bits 15:8 hold
/// the first capability's config-space offset, each entry's bits 15:8 the
/// next offset, 0 (or any reserved value below 0x40) ends the chain.
pub fn ehci_take_ownership<C: CfgSpace + ?Sized>(
    cfg: &mut C,
    locn: Locn,
    hccparams: u32,
    bound: Option<NonZeroU32>,
) -> Outcome {
    let mut off = (hccparams >> 8 & 0xff) as u16;
    let mut outcome = Outcome::NoLegacyCap;
    while off >= EECP_MIN {
        let cap = cfg.read32(locn, off);
        if cap as u8 == CAP_ID_LEGACY {
            let mut regs = EhciCapRegs { cfg: &mut *cfg, locn, off };
            outcome = outcome.max(claim(&mut regs, bound));
        }
        off = (cap >> 8 & 0xff) as u16;
    }
    outcome
}

/// Walk an XHCI controller's extended-capability list in MMIO.
///
/// `hccparams1` bits 31:16 give the first entry's offset from the
/// capability base in dwords; each entry's byte 1 gives the dword delta
/// to the next, 0 ends the list. `open` maps the 8-byte entry at a
/// physical address for the duration of its inspection; dropping the
/// returned accessor unmaps it.
pub fn xhci_take_ownership<W, F>(
    mut open: F,
    cap_base: u64,
    hccparams1: u32,
    bound: Option<NonZeroU32>,
) -> Outcome
where
    W: LegacyRegs,
    F: FnMut(u64) -> Option<W>,
{
    let mut xecp = (hccparams1 >> 16 & 0xffff) as u64;
    let mut pa = cap_base;
    let mut outcome = Outcome::NoLegacyCap;
    while xecp != 0 {
        pa += xecp * 4;
        let Some(mut regs) = open(pa) else {
            warn!("usb: extended capability at {pa:#x} unreachable");
            break;
        };
        let cap = regs.read(USBLEGSUP);
        if cap as u8 == CAP_ID_LEGACY {
            outcome = outcome.max(claim(&mut regs, bound));
        }
        xecp = (cap >> 8 & 0xff) as u64;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::testutil::MemCfg;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const L: Locn = Locn::new(0, 0, 0x1d, 0);

    /// Keeps BIOS_OWNED asserted for a scripted number of post-request
    /// reads, then releases.
    struct StickyBios {
        reads_until_release: u32,
        post_write_reads: u32,
        writes: Vec<u32>,
    }

    impl StickyBios {
        fn new(reads_until_release: u32) -> Self {
            Self { reads_until_release, post_write_reads: 0, writes: Vec::new() }
        }

        fn initial() -> u32 {
            LegacySup::BIOS_OWNED.bits() | CAP_ID_LEGACY as u32
        }
    }

    impl LegacyRegs for StickyBios {
        fn read(&mut self, dword: usize) -> u32 {
            if dword == USBLEGCTLSTS {
                return 0x0300_0000;
            }
            if self.writes.is_empty() {
                return Self::initial();
            }
            self.post_write_reads += 1;
            if self.post_write_reads > self.reads_until_release {
                LegacySup::OS_OWNED.bits() | CAP_ID_LEGACY as u32
            } else {
                Self::initial() | LegacySup::OS_OWNED.bits()
            }
        }

        fn write(&mut self, dword: usize, val: u32) {
            assert_eq!(dword, USBLEGSUP);
            self.writes.push(val);
        }
    }

    #[test]
    fn handshake_reads_exactly_n_plus_one_times_after_the_request() {
        for n in [0u32, 1, 7, 63] {
            let mut regs = StickyBios::new(n);
            assert_eq!(claim(&mut regs, None), Outcome::Released);
            assert_eq!(regs.post_write_reads, n + 1, "n = {n}");
            // One request write, BIOS bit dropped, OS bit raised, low
            // bytes untouched.
            assert_eq!(
                regs.writes,
                vec![LegacySup::OS_OWNED.bits() | CAP_ID_LEGACY as u32]
            );
        }
    }

    #[test]
    fn already_os_owned_writes_nothing() {
        struct Quiet;
        impl LegacyRegs for Quiet {
            fn read(&mut self, dword: usize) -> u32 {
                if dword == USBLEGSUP { CAP_ID_LEGACY as u32 } else { 0 }
            }
            fn write(&mut self, _dword: usize, _val: u32) {
                panic!("no write expected");
            }
        }
        assert_eq!(claim(&mut Quiet, None), Outcome::AlreadyOsOwned);
    }

    #[test]
    fn bounded_handshake_times_out() {
        let mut regs = StickyBios::new(u32::MAX);
        let outcome = claim(&mut regs, NonZeroU32::new(5));
        assert_eq!(outcome, Outcome::TimedOut);
        assert_eq!(regs.post_write_reads, 5);
    }

    #[test]
    fn ehci_walks_the_chain_and_claims_the_legacy_cap() {
        let mut cfg = MemCfg::filled(0);
        // Entry at 0x40: some other capability, next = 0x48.
        cfg.bytes[0x40..0x44].copy_from_slice(&(0x0au32 | 0x48 << 8).to_le_bytes());
        // Entry at 0x48: legacy support, BIOS-owned, end of chain.
        cfg.bytes[0x48..0x4c]
            .copy_from_slice(&(CAP_ID_LEGACY as u32 | LegacySup::BIOS_OWNED.bits()).to_le_bytes());

        let hccparams = 0x40 << 8;
        assert_eq!(ehci_take_ownership(&mut cfg, L, hccparams, None), Outcome::Released);

        let sup = u32::from_le_bytes(cfg.bytes[0x48..0x4c].try_into().unwrap());
        assert_eq!(
            LegacySup::from_bits_retain(sup) & (LegacySup::BIOS_OWNED | LegacySup::OS_OWNED),
            LegacySup::OS_OWNED
        );
        // The non-legacy entry was left alone.
        assert_eq!(cfg.bytes[0x40], 0x0a);
    }

    #[test]
    fn ehci_without_extended_caps_reports_none() {
        let mut cfg = MemCfg::filled(0);
        assert_eq!(ehci_take_ownership(&mut cfg, L, 0, None), Outcome::NoLegacyCap);
    }

    /// One mapped 8-byte entry; drop counts as unmap.
    struct VecWindow {
        mem: Rc<RefCell<Vec<u32>>>,
        base: usize,
        closes: Rc<Cell<u32>>,
    }

    impl LegacyRegs for VecWindow {
        fn read(&mut self, dword: usize) -> u32 {
            self.mem.borrow()[self.base + dword]
        }

        fn write(&mut self, dword: usize, val: u32) {
            self.mem.borrow_mut()[self.base + dword] = val;
        }
    }

    impl Drop for VecWindow {
        fn drop(&mut self) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    #[test]
    fn xhci_maps_each_entry_transiently_and_claims() {
        const CAP_BASE: u64 = 0x8_0000_1000;
        let mem: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(vec![0; 16]));
        // First entry at dword 2: vendor cap, next 3 dwords on.
        mem.borrow_mut()[2] = 0xc0 | 3 << 8;
        // Second entry at dword 5: legacy support, BIOS-owned, last.
        mem.borrow_mut()[5] = CAP_ID_LEGACY as u32 | LegacySup::BIOS_OWNED.bits();

        let opened: RefCell<Vec<u64>> = RefCell::new(Vec::new());
        let closes: Rc<Cell<u32>> = Rc::default();
        let outcome = xhci_take_ownership(
            |phys| {
                opened.borrow_mut().push(phys);
                Some(VecWindow {
                    mem: mem.clone(),
                    base: ((phys - CAP_BASE) / 4) as usize,
                    closes: closes.clone(),
                })
            },
            CAP_BASE,
            2 << 16, // xECP = 2 dwords past the capability base
            None,
        );

        assert_eq!(outcome, Outcome::Released);
        assert_eq!(*opened.borrow(), vec![CAP_BASE + 8, CAP_BASE + 20]);
        assert_eq!(closes.get(), 2, "every mapped entry must be unmapped");
        let sup = LegacySup::from_bits_retain(mem.borrow()[5]);
        assert!(sup.contains(LegacySup::OS_OWNED));
        assert!(!sup.contains(LegacySup::BIOS_OWNED));
    }

    #[test]
    fn xhci_with_zero_xecp_touches_nothing() {
        let outcome = xhci_take_ownership(
            |_phys| -> Option<StickyBios> { panic!("no entry should be opened") },
            0x1000,
            0,
            None,
        );
        assert_eq!(outcome, Outcome::NoLegacyCap);
    }
}
