// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! The boot-parameter list.
//!
//! Stage 1 serializes everything it learned about the machine into a
//! forward-linked chain of tagged records in boot-time base memory and
//! hands stage 2 the head address in a register. The list is append-only
//! while it is being built and strictly read-only afterwards.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::e820::MemRange;

/// Little-endian four-character record tag.
pub const fn magic32(s: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*s)
}

/// PCI device function.
pub const BP_PCID: u32 = magic32(b"PCID");
/// Base-memory boundary pair.
pub const BP_BMEM: u32 = magic32(b"bMEM");
/// One extended-memory range.
pub const BP_XMEM: u32 = magic32(b"xMEM");
/// ACPI root pointer.
pub const BP_RSDP: u32 = magic32(b"RSDP");

/// Common record head; `size` bytes of payload follow it in memory.
/// `next` is the physical address of the next record, 0 at the tail.
#[repr(C)]
pub struct RecordHeader {
    pub next: u64,
    pub tag: u32,
    pub size: u32,
}

/// `PCID` payload. `pci_id` packs vendor low / device high; `class_if`
/// packs `class << 8 | prog_if` as read from config space. The option-ROM
/// segment pair is part of the record layout but stays zero here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PciDev {
    pub pci_locn: u32,
    pub pci_id: u32,
    pub class_if: u32,
    pub rimg_seg: u16,
    pub rimg_rt_seg: u16,
}

/// `bMEM` payload: real-mode segments (address >> 4) of the boot-time
/// bottom and run-time top marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, packed)]
pub struct BmemRange {
    pub boottime_bot_seg: u16,
    pub runtime_top_seg: u16,
}

/// `RSDP` payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RsdpDesc {
    pub rsdp_addr: u64,
    pub rsdp_len: u32,
}

/// Boot-time storage the list is built in.
///
/// # Safety
/// Implementations must hand out blocks that stay valid, disjoint and
/// unmoved for the arena's whole lifetime; the list keeps raw addresses
/// into them.
pub unsafe trait BparmArena {
    fn alloc_boottime(&mut self, size: usize, align: usize) -> Option<NonNull<u8>>;
}

/// Append-only builder; the head address is what goes into the handoff
/// register.
pub struct BparmList {
    head: u64,
    tail: u64,
}

impl BparmList {
    pub const fn new() -> Self {
        Self { head: 0, tail: 0 }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Append a record with a zero-initialized payload of `size` bytes and
    /// return the payload for the caller to fill. `None` means the arena
    /// is out of boot-time memory, which stage 1 treats as fatal.
    pub fn add<'a, A: BparmArena + ?Sized>(
        &mut self,
        arena: &'a mut A,
        tag: u32,
        size: u32,
    ) -> Option<&'a mut [u8]> {
        let total = size_of::<RecordHeader>() + size as usize;
        let block = arena.alloc_boottime(total, align_of::<RecordHeader>())?;
        let addr = block.as_ptr() as u64;
        unsafe {
            core::ptr::write_bytes(block.as_ptr(), 0, total);
            let hdr = block.as_ptr() as *mut RecordHeader;
            (*hdr).tag = tag;
            (*hdr).size = size;
            if self.head == 0 {
                self.head = addr;
            } else {
                (*(self.tail as *mut RecordHeader)).next = addr;
            }
            self.tail = addr;
            Some(core::slice::from_raw_parts_mut(
                block.as_ptr().add(size_of::<RecordHeader>()),
                size as usize,
            ))
        }
    }

    pub fn add_pci_dev<A: BparmArena + ?Sized>(
        &mut self,
        arena: &mut A,
        dev: &PciDev,
    ) -> Option<()> {
        let payload = self.add(arena, BP_PCID, size_of::<PciDev>() as u32)?;
        unsafe { (payload.as_mut_ptr() as *mut PciDev).write_unaligned(*dev) };
        Some(())
    }

    pub fn add_mem_range<A: BparmArena + ?Sized>(
        &mut self,
        arena: &mut A,
        range: &MemRange,
    ) -> Option<()> {
        let payload = self.add(arena, BP_XMEM, size_of::<MemRange>() as u32)?;
        unsafe { (payload.as_mut_ptr() as *mut MemRange).write_unaligned(*range) };
        Some(())
    }

    pub fn add_rsdp<A: BparmArena + ?Sized>(
        &mut self,
        arena: &mut A,
        rsdp_addr: u64,
        rsdp_len: u32,
    ) -> Option<()> {
        let payload = self.add(arena, BP_RSDP, size_of::<RsdpDesc>() as u32)?;
        let desc = RsdpDesc { rsdp_addr, rsdp_len };
        unsafe { (payload.as_mut_ptr() as *mut RsdpDesc).write_unaligned(desc) };
        Some(())
    }

    /// Append the `bMEM` record with a zeroed payload. The boundary pair
    /// only becomes known when the pool is sealed, after which the caller
    /// fills it through the returned pointer; allocating the record first
    /// keeps the seal from moving under it.
    pub fn add_bmem<A: BparmArena + ?Sized>(&mut self, arena: &mut A) -> Option<NonNull<BmemRange>> {
        let payload = self.add(arena, BP_BMEM, size_of::<BmemRange>() as u32)?;
        NonNull::new(payload.as_mut_ptr() as *mut BmemRange)
    }
}

/// One record as seen by a reader.
pub struct Record {
    tag: u32,
    payload: *const u8,
    len: usize,
}

impl Record {
    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.payload, self.len) }
    }

    /// Read the payload as `T`.
    ///
    /// # Safety
    /// `T` must be a plain `#[repr(C)]` value type for which any bit
    /// pattern is valid.
    pub unsafe fn payload<T: Copy>(&self) -> Option<T> {
        if self.len < size_of::<T>() {
            return None;
        }
        Some(unsafe { (self.payload as *const T).read_unaligned() })
    }
}

/// Walks the chain from the handoff head address.
pub struct Records {
    cur: u64,
}

impl Records {
    /// # Safety
    /// `head` must be 0 or the address of a well-formed record chain,
    /// readable at its physical addresses for the iterator's lifetime.
    pub unsafe fn new(head: u64) -> Self {
        Self { cur: head }
    }
}

impl Iterator for Records {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.cur == 0 {
            return None;
        }
        let hdr = self.cur as *const RecordHeader;
        let (next, tag, size) = unsafe { ((*hdr).next, (*hdr).tag, (*hdr).size) };
        let payload = unsafe { (hdr as *const u8).add(size_of::<RecordHeader>()) };
        self.cur = next;
        Some(Record { tag, payload, len: size as usize })
    }
}
