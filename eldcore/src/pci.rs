// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! PCI configuration space access.
//!
//! The mechanism-#1 port pair only does aligned 32-bit cycles, so the
//! unaligned accessors here synthesize wider views from the two straddled
//! words. Option-ROM images poke config registers at whatever offset suits
//! them, which is why the unaligned path exists at all.

use core::fmt;

/// Mechanism-#1 address and data ports.
pub const CFG_ADDR_PORT: u16 = 0xCF8;
pub const CFG_DATA_PORT: u16 = 0xCFC;

/// Packed PCI location: `seg:16 | bus:8 | dev:5 | func:3`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locn(u32);

impl Locn {
    pub const fn new(seg: u16, bus: u8, dev: u8, func: u8) -> Self {
        Self(
            (seg as u32) << 16
                | (bus as u32) << 8
                | ((dev as u32) & 0x1f) << 3
                | (func as u32) & 0x7,
        )
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild a location from its packed form, e.g. out of a `PCID`
    /// record written by an earlier boot stage.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn seg(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn bus(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn dev(self) -> u8 {
        (self.0 >> 3) as u8 & 0x1f
    }

    pub const fn func(self) -> u8 {
        self.0 as u8 & 0x7
    }
}

impl fmt::Display for Locn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.seg(),
            self.bus(),
            self.dev(),
            self.func()
        )
    }
}

impl fmt::Debug for Locn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// CONFIG_ADDRESS word for `(locn, off)`; `off` low bits land in the
/// register-number field, the enable bit is always set. Segment group is
/// not representable through the port pair and must be 0 there.
pub const fn cfg_addr(locn: Locn, off: u16) -> u32 {
    1 << 31 | (locn.raw() & 0xffff) << 8 | (off as u32) & 0xfc
}

/// Aligned 32-bit config cycles; everything else is derived.
///
/// `off` for `read32`/`write32` must be 4-byte aligned. `read16` must not
/// straddle a word boundary (`off & 3 <= 2`).
pub trait CfgSpace {
    fn read32(&mut self, locn: Locn, off: u16) -> u32;
    fn write32(&mut self, locn: Locn, off: u16, val: u32);

    fn read32_any(&mut self, locn: Locn, off: u16) -> u32 {
        let a = off & !3;
        let lo = self.read32(locn, a);
        match off & 3 {
            0 => lo,
            k => {
                let hi = self.read32(locn, a + 4);
                match k {
                    1 => lo >> 8 | hi << 24,
                    2 => lo >> 16 | hi << 16,
                    _ => lo >> 24 | hi << 8,
                }
            }
        }
    }

    fn write32_any(&mut self, locn: Locn, off: u16, val: u32) {
        let a = off & !3;
        let k = off & 3;
        if k == 0 {
            self.write32(locn, a, val);
            return;
        }
        // Read-modify-write both straddled words, keeping their bytes
        // outside the target window.
        let lo = self.read32(locn, a);
        let hi = self.read32(locn, a + 4);
        let (lo, hi) = match k {
            1 => (lo & 0x0000_00ff | val << 8, hi & 0xffff_ff00 | val >> 24),
            2 => (lo & 0x0000_ffff | val << 16, hi & 0xffff_0000 | val >> 16),
            _ => (lo & 0x00ff_ffff | val << 24, hi & 0xff00_0000 | val >> 8),
        };
        self.write32(locn, a, lo);
        self.write32(locn, a + 4, hi);
    }

    fn read16(&mut self, locn: Locn, off: u16) -> u16 {
        debug_assert!(off & 3 <= 2);
        (self.read32(locn, off & !3) >> (8 * (off & 3))) as u16
    }

    fn read8(&mut self, locn: Locn, off: u16) -> u8 {
        (self.read32(locn, off & !3) >> (8 * (off & 3))) as u8
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::{CfgSpace, Locn};

    /// One function's worth of config space backed by a byte array.
    pub struct MemCfg {
        pub bytes: [u8; 64],
    }

    impl MemCfg {
        pub fn filled(fill: u8) -> Self {
            Self { bytes: [fill; 64] }
        }
    }

    impl CfgSpace for MemCfg {
        fn read32(&mut self, _locn: Locn, off: u16) -> u32 {
            assert_eq!(off & 3, 0);
            let off = off as usize;
            u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
        }

        fn write32(&mut self, _locn: Locn, off: u16, val: u32) {
            assert_eq!(off & 3, 0);
            let off = off as usize;
            self.bytes[off..off + 4].copy_from_slice(&val.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::MemCfg;
    use super::*;

    const L: Locn = Locn::new(0, 0, 3, 1);

    #[test]
    fn locn_packs_and_prints() {
        let l = Locn::new(1, 0x20, 0x1f, 7);
        assert_eq!(l.raw(), 1 << 16 | 0x20 << 8 | 0x1f << 3 | 7);
        assert_eq!(l.seg(), 1);
        assert_eq!(l.bus(), 0x20);
        assert_eq!(l.dev(), 0x1f);
        assert_eq!(l.func(), 7);
        assert_eq!(format!("{l}"), "0001:20:1f.7");
    }

    #[test]
    fn cfg_addr_masks_segment_and_sets_enable() {
        let l = Locn::new(2, 0xa5, 3, 0);
        let a = cfg_addr(l, 0x3d);
        assert_eq!(a >> 31, 1);
        assert_eq!(a >> 8 & 0xffff, l.raw() & 0xffff);
        assert_eq!(a & 0xff, 0x3c);
    }

    #[test]
    fn unaligned_dword_round_trips_between_sentinels() {
        // Write a pattern at every shift of an 8-byte window and check
        // that the read-back matches and that no neighbor byte moved.
        for off in 0u16..=4 {
            let mut cfg = MemCfg::filled(0x5a);
            cfg.write32_any(L, 4 + off, 0xa1b2_c3d4);
            assert_eq!(cfg.read32_any(L, 4 + off), 0xa1b2_c3d4, "off {off}");
            for i in 0..cfg.bytes.len() {
                let window = (4 + off as usize)..(8 + off as usize);
                if !window.contains(&i) {
                    assert_eq!(cfg.bytes[i], 0x5a, "byte {i} clobbered at off {off}");
                }
            }
        }
    }

    #[test]
    fn aligned_write_is_a_passthrough() {
        let mut cfg = MemCfg::filled(0xff);
        cfg.write32_any(L, 8, 0x0102_0304);
        assert_eq!(cfg.bytes[8..12], [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(cfg.bytes[12], 0xff);
    }

    #[test]
    fn narrow_reads_pick_from_containing_word() {
        let mut cfg = MemCfg::filled(0);
        cfg.bytes[0..4].copy_from_slice(&0x8086_1237u32.to_le_bytes());
        assert_eq!(cfg.read16(L, 0), 0x1237);
        assert_eq!(cfg.read16(L, 2), 0x8086);
        assert_eq!(cfg.read8(L, 1), 0x12);
        assert_eq!(cfg.read8(L, 3), 0x80);
    }
}
