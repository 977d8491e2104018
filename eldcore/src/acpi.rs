// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Minimal ACPI walk: RSDP -> XSDT -> MADT, just far enough to find every
//! I/O-APIC and park its redirection entries before the 8259 takes over.
//!
//! Table memory is reached through a `TableMapper` so the walk can run
//! identity-mapped on hardware and over synthetic tables in tests. Tables
//! self-report their length and none of it is trusted: every table is
//! probed at header size first, remapped at the reported length, and the
//! mapper is expected to refuse silly ranges.

use core::mem::size_of;
use core::ptr::NonNull;

use log::{debug, warn};

use crate::cksum;

pub const RSDP_SIG: [u8; 8] = *b"RSD PTR ";
/// An ACPI 1.0 RSDP is 20 bytes; 2.0+ appends the XSDT fields.
pub const RSDP_V1_LEN: usize = 20;

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp {
    pub sig: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub rev: u8,
    pub rsdt_addr: u32,
    pub length: u32,
    pub xsdt_addr: u64,
    pub ext_checksum: u8,
    pub _rsvd: [u8; 3],
}

impl Rsdp {
    /// Bytes covered by the applicable checksum: the 2.0 length field, or
    /// the fixed 1.0 size for revision 0/1 tables.
    pub fn total_len(&self) -> u32 {
        if self.rev >= 2 { self.length } else { RSDP_V1_LEN as u32 }
    }
}

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct SdtHeader {
    pub sig: [u8; 4],
    pub length: u32,
    pub rev: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_rev: u32,
    pub creator_id: u32,
    pub creator_rev: u32,
}

#[repr(C, packed)]
pub struct MadtHeader {
    pub header: SdtHeader,
    pub lapic_addr: u32,
    pub flags: u32,
}

const MADT_ENTRY_IOAPIC: u8 = 1;

/// Redirection entries parked per I/O-APIC. The low dword of entry `i`
/// sits at register `0x10 + 2 * i`; bit 16 is the mask.
pub const REDIR_ENTRIES: u32 = 24;
pub const IOAPIC_REDTBL_BASE: u32 = 0x10;
pub const IOAPIC_REDTBL_MASKED: u32 = 1 << 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcpiError {
    /// The RSDP signature did not match; the pointer is garbage.
    BadRsdpSignature,
    /// The mapper refused a table range.
    MapFailed,
}

/// Maps physical table memory for the duration of a walk step.
///
/// `map` returns a pointer valid for `len` bytes or `None`; `unmap` is
/// handed back exactly what `map` produced. Implementations bound-check
/// `len` since it usually comes straight out of an ACPI length field.
pub trait TableMapper {
    fn map(&self, phys: u64, len: usize) -> Option<NonNull<u8>>;
    fn unmap(&self, ptr: NonNull<u8>, phys: u64, len: usize);
}

/// I/O-APIC register window: write the register index, then access the
/// data window.
pub trait IoApicRegs {
    fn select(&mut self, reg: u32);
    fn window_read(&mut self) -> u32;
    fn window_write(&mut self, val: u32);
}

/// RAII mapping of one system-description table.
///
/// Two-phase: the header is probed first, then the mapping is grown to
/// the table's self-reported length. Unmaps on every exit path.
#[derive(Debug)]
pub struct MappedTable<'m, M: TableMapper> {
    mapper: &'m M,
    ptr: NonNull<u8>,
    phys: u64,
    len: usize,
    mapped: usize,
}

impl<'m, M: TableMapper> MappedTable<'m, M> {
    const PROBE: usize = size_of::<SdtHeader>();

    pub fn open(mapper: &'m M, phys: u64) -> Result<Self, AcpiError> {
        let ptr = mapper.map(phys, Self::PROBE).ok_or(AcpiError::MapFailed)?;
        let len = {
            let hdr = ptr.as_ptr() as *const SdtHeader;
            (unsafe { core::ptr::addr_of!((*hdr).length).read_unaligned() }) as usize
        };
        if len > Self::PROBE {
            mapper.unmap(ptr, phys, Self::PROBE);
            let ptr = mapper.map(phys, len).ok_or(AcpiError::MapFailed)?;
            return Ok(Self { mapper, ptr, phys, len, mapped: len });
        }
        Ok(Self { mapper, ptr, phys, len, mapped: Self::PROBE })
    }

    /// Self-reported table length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn header(&self) -> SdtHeader {
        unsafe { (self.ptr.as_ptr() as *const SdtHeader).read_unaligned() }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len.min(self.mapped)) }
    }
}

impl<M: TableMapper> Drop for MappedTable<'_, M> {
    fn drop(&mut self) {
        self.mapper.unmap(self.ptr, self.phys, self.mapped);
    }
}

/// What a walk found; the caller decides how loudly to complain about
/// zeros in here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub madt_found: bool,
    pub ioapics: u32,
    pub masked_entries: u32,
}

/// Park all 24 redirection entries of one I/O-APIC: read each low dword
/// through the window and write it back with the mask bit set.
pub fn mask_redirections<R: IoApicRegs>(regs: &mut R) -> u32 {
    for i in 0..REDIR_ENTRIES {
        regs.select(IOAPIC_REDTBL_BASE + 2 * i);
        let lo = regs.window_read();
        regs.window_write(lo | IOAPIC_REDTBL_MASKED);
    }
    REDIR_ENTRIES
}

/// Walk RSDP -> XSDT -> MADT and mask every I/O-APIC found.
///
/// `open_ioapic` turns an I/O-APIC's MMIO physical address into a register
/// accessor; it returns `None` when the window cannot be reached, which
/// downgrades that controller to a warning.
///
/// Only a bad RSDP signature is an error the caller must treat as fatal.
/// A missing XSDT or MADT yields a default-ish report the caller can log.
pub fn scan<M, I, F>(
    mapper: &M,
    rsdp_addr: u64,
    rsdp_len: u32,
    mut open_ioapic: F,
) -> Result<ScanReport, AcpiError>
where
    M: TableMapper,
    I: IoApicRegs,
    F: FnMut(u64) -> Option<I>,
{
    let mut report = ScanReport::default();

    let xsdt_addr = {
        let want = (rsdp_len as usize).max(size_of::<Rsdp>());
        let ptr = mapper.map(rsdp_addr, want).ok_or(AcpiError::MapFailed)?;
        let guard = RsdpGuard { mapper, ptr, phys: rsdp_addr, len: want };
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), want) };
        if bytes[..8] != RSDP_SIG {
            return Err(AcpiError::BadRsdpSignature);
        }
        let rsdp = unsafe { (ptr.as_ptr() as *const Rsdp).read_unaligned() };
        if !cksum::ok(&bytes[..RSDP_V1_LEN]) {
            warn!("acpi: RSDP v1 checksum mismatch, walking anyway");
        }
        if rsdp.rev >= 2 {
            let covered = (rsdp.total_len() as usize).min(want);
            if !cksum::ok(&bytes[..covered]) {
                warn!("acpi: RSDP extended checksum mismatch, walking anyway");
            }
        }
        drop(guard);
        if rsdp.rev < 2 { 0 } else { rsdp.xsdt_addr }
    };

    if xsdt_addr == 0 {
        warn!("acpi: no XSDT, leaving I/O-APICs alone");
        return Ok(report);
    }

    let xsdt = MappedTable::open(mapper, xsdt_addr)?;
    let n_entries = xsdt.len().saturating_sub(size_of::<SdtHeader>()) / 8;
    debug!("acpi: XSDT at {xsdt_addr:#x}, {n_entries} entries");

    for i in 0..n_entries {
        let at = size_of::<SdtHeader>() + i * 8;
        let entry = u64::from_le_bytes(xsdt.bytes()[at..at + 8].try_into().unwrap_or([0; 8]));
        if entry == 0 {
            continue;
        }
        let table = match MappedTable::open(mapper, entry) {
            Ok(t) => t,
            Err(e) => {
                warn!("acpi: cannot map table at {entry:#x}: {e:?}");
                continue;
            }
        };
        if table.header().sig != *b"APIC" {
            continue;
        }
        report.madt_found = true;
        walk_madt(&table, &mut open_ioapic, &mut report);
    }

    Ok(report)
}

fn walk_madt<M, I, F>(madt: &MappedTable<'_, M>, open_ioapic: &mut F, report: &mut ScanReport)
where
    M: TableMapper,
    I: IoApicRegs,
    F: FnMut(u64) -> Option<I>,
{
    let bytes = madt.bytes();
    if bytes.len() < size_of::<MadtHeader>() {
        warn!("acpi: MADT shorter than its own header");
        return;
    }
    let mut p = size_of::<MadtHeader>();
    while p + 2 <= bytes.len() {
        let (typ, len) = (bytes[p], bytes[p + 1] as usize);
        if len < 2 || p + len > bytes.len() {
            warn!("acpi: malformed MADT entry at offset {p}");
            break;
        }
        if typ == MADT_ENTRY_IOAPIC && len >= 12 {
            let id = bytes[p + 2];
            let phys = u32::from_le_bytes(bytes[p + 4..p + 8].try_into().unwrap_or([0; 4])) as u64;
            match open_ioapic(phys) {
                Some(mut regs) => {
                    report.masked_entries += mask_redirections(&mut regs);
                    report.ioapics += 1;
                    debug!("acpi: I/O-APIC {id} at {phys:#x} parked");
                }
                None => warn!("acpi: I/O-APIC {id} at {phys:#x} unreachable"),
            }
        }
        p += len;
    }
}

/// The RSDP is not an SDT (no length field at the SDT offset), so its
/// mapping gets its own little guard.
struct RsdpGuard<'m, M: TableMapper> {
    mapper: &'m M,
    ptr: NonNull<u8>,
    phys: u64,
    len: usize,
}

impl<M: TableMapper> Drop for RsdpGuard<'_, M> {
    fn drop(&mut self) {
        self.mapper.unmap(self.ptr, self.phys, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Identity "mapper" over host allocations that logs map/unmap pairs.
    #[derive(Default)]
    struct HostMapper {
        ops: RefCell<Vec<(u64, usize, bool)>>, // (phys, len, is_map)
        refuse_above: Option<usize>,
    }

    impl TableMapper for HostMapper {
        fn map(&self, phys: u64, len: usize) -> Option<NonNull<u8>> {
            if self.refuse_above.is_some_and(|cap| len > cap) {
                return None;
            }
            self.ops.borrow_mut().push((phys, len, true));
            NonNull::new(phys as *mut u8)
        }

        fn unmap(&self, _ptr: NonNull<u8>, phys: u64, len: usize) {
            self.ops.borrow_mut().push((phys, len, false));
        }
    }

    impl HostMapper {
        fn assert_balanced(&self) {
            let ops = self.ops.borrow();
            let mut live: Vec<(u64, usize)> = Vec::new();
            for (phys, len, is_map) in ops.iter() {
                if *is_map {
                    live.push((*phys, *len));
                } else {
                    let at = live
                        .iter()
                        .position(|(p, l)| p == phys && l == len)
                        .expect("unmap without matching map");
                    live.remove(at);
                }
            }
            assert!(live.is_empty(), "leaked mappings: {live:?}");
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Op {
        Select(u32),
        Read,
        Write(u32),
    }

    /// Register window whose reads derive from the selected register, so
    /// write-back values can be checked exactly.
    struct FakeIoApic {
        selected: u32,
        log: Rc<RefCell<Vec<Op>>>,
    }

    impl IoApicRegs for FakeIoApic {
        fn select(&mut self, reg: u32) {
            self.selected = reg;
            self.log.borrow_mut().push(Op::Select(reg));
        }

        fn window_read(&mut self) -> u32 {
            self.log.borrow_mut().push(Op::Read);
            0xa000_0000 | self.selected
        }

        fn window_write(&mut self, val: u32) {
            self.log.borrow_mut().push(Op::Write(val));
        }
    }

    fn sdt_header(sig: &[u8; 4], length: u32) -> Vec<u8> {
        let mut h = vec![0u8; size_of::<SdtHeader>()];
        h[0..4].copy_from_slice(sig);
        h[4..8].copy_from_slice(&length.to_le_bytes());
        h
    }

    /// Boxed synthetic table whose "physical" address is its host address.
    fn pin(bytes: Vec<u8>) -> (Box<[u8]>, u64) {
        let boxed = bytes.into_boxed_slice();
        let addr = boxed.as_ptr() as u64;
        (boxed, addr)
    }

    fn build_rsdp(xsdt_addr: u64) -> (Box<[u8]>, u64) {
        let mut r = vec![0u8; size_of::<Rsdp>()];
        r[0..8].copy_from_slice(&RSDP_SIG);
        r[15] = 2; // revision
        r[20..24].copy_from_slice(&(size_of::<Rsdp>() as u32).to_le_bytes());
        r[24..32].copy_from_slice(&xsdt_addr.to_le_bytes());
        crate::cksum::fixup(&mut r[..RSDP_V1_LEN], 8);
        crate::cksum::fixup(&mut r, 32);
        pin(r)
    }

    fn build_madt(ioapic_addrs: &[u32]) -> (Box<[u8]>, u64) {
        let mut m = sdt_header(b"APIC", 0);
        m.extend_from_slice(&0xfee0_0000u32.to_le_bytes()); // lapic_addr
        m.extend_from_slice(&1u32.to_le_bytes()); // flags: PC-AT compat
        // A processor LAPIC entry the walk must skip over.
        m.extend_from_slice(&[0, 8, 0, 0, 1, 0, 0, 0]);
        for (i, addr) in ioapic_addrs.iter().enumerate() {
            let mut e = vec![1u8, 12, i as u8, 0];
            e.extend_from_slice(&addr.to_le_bytes());
            e.extend_from_slice(&0u32.to_le_bytes()); // gsi base
            m.extend_from_slice(&e);
        }
        let len = m.len() as u32;
        m[4..8].copy_from_slice(&len.to_le_bytes());
        pin(m)
    }

    fn build_xsdt(entries: &[u64]) -> (Box<[u8]>, u64) {
        let mut x = sdt_header(b"XSDT", 0);
        for e in entries {
            x.extend_from_slice(&e.to_le_bytes());
        }
        let len = x.len() as u32;
        x[4..8].copy_from_slice(&len.to_le_bytes());
        pin(x)
    }

    #[test]
    fn full_walk_masks_exactly_24_entries_per_ioapic() {
        let (_madt, madt_addr) = build_madt(&[0xfec0_0000]);
        let (_facp, facp_addr) = pin(sdt_header(b"FACP", 36));
        let (_xsdt, xsdt_addr) = build_xsdt(&[facp_addr, madt_addr]);
        let (_rsdp, rsdp_addr) = build_rsdp(xsdt_addr);

        let mapper = HostMapper::default();
        let log: Rc<RefCell<Vec<Op>>> = Rc::default();
        let opened = RefCell::new(Vec::new());
        let report = scan(&mapper, rsdp_addr, RSDP_V1_LEN as u32, |phys| {
            opened.borrow_mut().push(phys);
            Some(FakeIoApic { selected: 0, log: log.clone() })
        })
        .unwrap();

        assert!(report.madt_found);
        assert_eq!(report.ioapics, 1);
        assert_eq!(report.masked_entries, 24);
        assert_eq!(*opened.borrow(), vec![0xfec0_0000]);

        // Exactly 24 select/read/write triples, each write = read | mask.
        let ops = log.borrow();
        assert_eq!(ops.len(), 24 * 3);
        for i in 0..24u32 {
            let reg = IOAPIC_REDTBL_BASE + 2 * i;
            assert_eq!(ops[3 * i as usize], Op::Select(reg));
            assert_eq!(ops[3 * i as usize + 1], Op::Read);
            assert_eq!(
                ops[3 * i as usize + 2],
                Op::Write(0xa000_0000 | reg | IOAPIC_REDTBL_MASKED)
            );
        }

        mapper.assert_balanced();
    }

    #[test]
    fn two_ioapics_mask_48() {
        let (_madt, madt_addr) = build_madt(&[0xfec0_0000, 0xfec1_0000]);
        let (_xsdt, xsdt_addr) = build_xsdt(&[madt_addr]);
        let (_rsdp, rsdp_addr) = build_rsdp(xsdt_addr);

        let mapper = HostMapper::default();
        let log: Rc<RefCell<Vec<Op>>> = Rc::default();
        let report = scan(&mapper, rsdp_addr, size_of::<Rsdp>() as u32, |_| {
            Some(FakeIoApic { selected: 0, log: log.clone() })
        })
        .unwrap();
        assert_eq!(report.ioapics, 2);
        assert_eq!(report.masked_entries, 48);
        assert_eq!(log.borrow().len(), 48 * 3);
        mapper.assert_balanced();
    }

    #[test]
    fn bad_rsdp_signature_is_an_error() {
        let mut bytes = vec![0u8; size_of::<Rsdp>()];
        bytes[0..8].copy_from_slice(b"XSD PTR ");
        let (_rsdp, rsdp_addr) = pin(bytes);

        let mapper = HostMapper::default();
        let err = scan(&mapper, rsdp_addr, 20, |_| None::<FakeIoApic>).unwrap_err();
        assert_eq!(err, AcpiError::BadRsdpSignature);
        mapper.assert_balanced();
    }

    #[test]
    fn missing_madt_reports_quietly() {
        let (_facp, facp_addr) = pin(sdt_header(b"FACP", 36));
        let (_xsdt, xsdt_addr) = build_xsdt(&[facp_addr]);
        let (_rsdp, rsdp_addr) = build_rsdp(xsdt_addr);

        let mapper = HostMapper::default();
        let report = scan(&mapper, rsdp_addr, 36, |_| None::<FakeIoApic>).unwrap();
        assert_eq!(report, ScanReport::default());
        mapper.assert_balanced();
    }

    #[test]
    fn unreachable_ioapic_window_downgrades_to_warning() {
        let (_madt, madt_addr) = build_madt(&[0xfec0_0000]);
        let (_xsdt, xsdt_addr) = build_xsdt(&[madt_addr]);
        let (_rsdp, rsdp_addr) = build_rsdp(xsdt_addr);

        let mapper = HostMapper::default();
        let report = scan(&mapper, rsdp_addr, 36, |_| None::<FakeIoApic>).unwrap();
        assert!(report.madt_found);
        assert_eq!(report.ioapics, 0);
        assert_eq!(report.masked_entries, 0);
        mapper.assert_balanced();
    }

    #[test]
    fn mapped_table_grows_to_reported_length_and_unmaps_both() {
        let (_xsdt, addr) = build_xsdt(&[0, 0, 0, 0]);

        let mapper = HostMapper::default();
        {
            let t = MappedTable::open(&mapper, addr).unwrap();
            assert_eq!(t.len(), 36 + 32);
        }
        let ops = mapper.ops.borrow().clone();
        assert_eq!(
            ops,
            vec![
                (addr, 36, true),
                (addr, 36, false),
                (addr, 68, true),
                (addr, 68, false),
            ]
        );
    }

    #[test]
    fn oversized_length_is_refused_by_the_mapper() {
        let (_huge, addr) = pin(sdt_header(b"APIC", 0x1000_0000));
        let mapper = HostMapper { refuse_above: Some(4096), ..Default::default() };
        assert_eq!(MappedTable::open(&mapper, addr).unwrap_err(), AcpiError::MapFailed);
        mapper.assert_balanced();
    }
}
