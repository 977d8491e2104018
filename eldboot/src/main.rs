// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Stage 1: runs as a UEFI application, gathers the facts stage 2 needs
//! (base memory, PCI devices, the ACPI root pointer, an E820-style memory
//! map), loads the stage-2 ELF at its linked physical addresses, leaves
//! boot services and drops to 32-bit protected mode through the trampoline.

#![no_std]
#![no_main]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod bmem;
mod conf;
mod pci;
mod tramp;

use alloc::vec::Vec;
use core::{arch::asm, ptr};
use log::{error, info, warn};
use uefi::prelude::*;
use uefi::{
    boot,
    boot::{AllocateType, MemoryType},
    fs::{FileSystem, Path},
    mem::memory_map::MemoryMap,
    runtime::{self, VariableVendor},
    system,
    table::cfg::ACPI2_GUID,
};
use xmas_elf::ElfFile;
use xmas_elf::header::{Class, Data, Machine, Type as ElfType};
use xmas_elf::program::Type as PhType;

use eldcore::bmem::BmemPool;
use eldcore::bparm::{BmemRange, BparmList, PciDev};
use eldcore::{acpi, cksum, e820};

use crate::bmem::{BootArena, FirmwareClaimer};

#[global_allocator]
static ALLOCATOR: uefi::allocator::Allocator = uefi::allocator::Allocator;

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe {
        loop {
            asm!("hlt");
        }
    }
}

/* ================== Serial (QEMU `-serial stdio`) ================== */
#[inline(always)]
unsafe fn serial_init() {
    const COM1: u16 = 0x3F8;
    asm!("out dx, al", in("dx") COM1 + 1, in("al") 0u8);
    asm!("out dx, al", in("dx") COM1 + 3, in("al") 0x80u8);
    asm!("out dx, al", in("dx") COM1 + 0, in("al") 0x01u8);
    asm!("out dx, al", in("dx") COM1 + 1, in("al") 0x00u8);
    asm!("out dx, al", in("dx") COM1 + 3, in("al") 0x03u8);
    asm!("out dx, al", in("dx") COM1 + 2, in("al") 0xC7u8);
    asm!("out dx, al", in("dx") COM1 + 4, in("al") 0x0Bu8);
}
#[inline(always)]
unsafe fn serial_putc(c: u8) {
    const COM1: u16 = 0x3F8;
    loop {
        let mut lsr: u8;
        asm!("in al, dx", out("al") lsr, in("dx") COM1 + 5);
        if (lsr & 0x20) != 0 {
            break;
        } // THR empty
    }
    asm!("out dx, al", in("dx") COM1, in("al") c);
}
fn serial_line(s: &str) {
    unsafe {
        for b in s.bytes() {
            serial_putc(b);
        }
        serial_putc(b'\r');
        serial_putc(b'\n');
    }
}
macro_rules! slog {
    ($($t:tt)*) => {{
        let s = alloc::format!($($t)*);
        serial_line(&s);
    }};
}

/* =================================== Entry =================================== */
#[entry]
fn main() -> Status {
    unsafe { serial_init() }
    serial_line(">>> Eldboot stage 1");

    if uefi::helpers::init().is_ok() {
        serial_line("[serial] helpers::init OK");
    } else {
        serial_line("[serial][FATAL] helpers::init failed");
        unsafe {
            loop {
                asm!("hlt");
            }
        }
    }
    info!(
        "Eldboot {} on UEFI {}, firmware {} rev {:#x}",
        env!("CARGO_PKG_VERSION"),
        system::uefi_revision(),
        system::firmware_vendor(),
        system::firmware_revision()
    );
    conf::init();
    log_step("loader start.");

    // ---- ACPI root pointer from the configuration tables ----
    let rsdp_addr = find_rsdp();
    let rsdp_len = probe_rsdp(rsdp_addr);
    slog!("[serial] RSDP at 0x{:x}, {} bytes", rsdp_addr, rsdp_len);
    log_step("RSDP found");

    // Stage 2 drops into unsigned real-mode code; a platform that enforces
    // signatures must not get that far.
    if secure_boot_on() {
        die(
            Status::SECURITY_VIOLATION,
            &format_args!("secure boot is enabled"),
        );
    }
    log_step("platform ok");

    conf::pause("claim base memory");
    let pool = init_base_mem();
    let mut arena = BootArena(pool);
    let mut bparm = BparmList::new();
    if bparm.add_rsdp(&mut arena, rsdp_addr, rsdp_len).is_none() {
        die(Status::OUT_OF_RESOURCES, &format_args!("bparm RSDP record"));
    }

    conf::pause("scan PCI");
    scan_pci(&mut arena, &mut bparm);

    conf::pause("load stage 2");
    let entry = load_stage2();

    let tramp_page = alloc_trampoline();
    slog!("[serial] trampoline  = 0x{:x}", tramp_page);

    // Temporary EBDA: run-time base memory, so it survives the handoff.
    let ebda = arena.alloc(1024, 16).unwrap_or_else(|e| {
        die(
            Status::OUT_OF_RESOURCES,
            &format_args!("temp EBDA alloc: {e:?}"),
        )
    });
    let ebda_seg = ebda >> 4;
    slog!("[serial] temp EBDA   = seg 0x{:x}", ebda_seg);

    conf::pause("hand off");
    push_mem_ranges(&mut arena, &mut bparm);

    // The bMEM record is appended while the pool is still open, then the
    // seal fills in the final boundary pair.
    let slot = bparm
        .add_bmem(&mut arena)
        .unwrap_or_else(|| die(Status::OUT_OF_RESOURCES, &format_args!("bparm bMEM record")));
    let (bot, top) = arena
        .fini()
        .unwrap_or_else(|e| die(Status::OUT_OF_RESOURCES, &format_args!("bmem seal: {e:?}")));
    unsafe {
        slot.as_ptr().write_unaligned(BmemRange {
            boottime_bot_seg: (bot >> 4) as u16,
            runtime_top_seg: (top >> 4) as u16,
        });
    }
    let base_kib = top / 1024;

    let handoff = tramp::Handoff {
        base_kib,
        ebda_seg,
        stack: (tramp_page + tramp::STACK_OFF) as u32,
        bparm_head: bparm.head() as u32,
        entry,
    };
    tramp::install(tramp_page, &handoff);

    info!(
        "handoff: base {} KiB, boottime 0x{:x}..0x{:x}, bparm 0x{:x}, entry 0x{:x}",
        base_kib,
        bot,
        top,
        bparm.head(),
        entry
    );
    log_step("stage 1 done");
    serial_line("[serial] ExitBootServices …");
    let _ = unsafe { boot::exit_boot_services(None) };

    unsafe { tramp::enter(tramp_page) }
}

/* ================== Discovery ================== */
fn find_rsdp() -> u64 {
    let found = system::with_config_table(|tables| {
        let mut acpi2 = None;
        for t in tables {
            info!("conf table {} at {:p}", t.guid, t.address);
            if t.guid == ACPI2_GUID && acpi2.is_none() {
                acpi2 = Some(t.address as u64);
            }
        }
        acpi2
    });
    found.unwrap_or_else(|| die(Status::UNSUPPORTED, &format_args!("no ACPI 2+ RSDP")))
}

// Boot services identity-map everything, so the table is read in place.
fn probe_rsdp(addr: u64) -> u32 {
    let rsdp = unsafe { (addr as *const acpi::Rsdp).read_unaligned() };
    if rsdp.sig != acpi::RSDP_SIG {
        die(
            Status::UNSUPPORTED,
            &format_args!("RSDP signature mismatch at 0x{addr:x}"),
        );
    }
    let head = unsafe { core::slice::from_raw_parts(addr as *const u8, acpi::RSDP_V1_LEN) };
    if !cksum::ok(head) {
        warn!("RSDP v1 checksum mismatch, continuing");
    }
    rsdp.total_len()
}

fn secure_boot_on() -> bool {
    let mut buf = [0u8; 1];
    match runtime::get_variable(
        cstr16!("SecureBoot"),
        &VariableVendor::GLOBAL_VARIABLE,
        &mut buf,
    ) {
        Ok((data, _)) => data.first().copied() == Some(1),
        // No variable: the platform does not do secure boot at all.
        Err(_) => false,
    }
}

/* ================== Base memory ================== */
fn init_base_mem() -> BmemPool {
    let mm = boot::memory_map(MemoryType::LOADER_DATA)
        .unwrap_or_else(|e| die(Status::OUT_OF_RESOURCES, &format_args!("memory map: {e:?}")));
    // Extents below 1 MiB that come free once boot services end. They widen
    // the measured run, the pool never hands them out itself.
    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for d in mm.entries() {
        if !freed_at_exit(d.ty) {
            continue;
        }
        let start = d.phys_start;
        if start >= 0x10_0000 {
            continue;
        }
        let end = (start + d.page_count * 4096).min(0x10_0000);
        if end > start {
            ranges.push((start, end - start));
        }
    }
    drop(mm);

    match BmemPool::init(&mut FirmwareClaimer, ranges) {
        Ok(p) => {
            log_step("base memory ready");
            p
        }
        Err(e) => die(
            Status::OUT_OF_RESOURCES,
            &format_args!("base memory: {e:?}"),
        ),
    }
}

fn freed_at_exit(ty: MemoryType) -> bool {
    matches!(
        ty,
        MemoryType::LOADER_CODE
            | MemoryType::LOADER_DATA
            | MemoryType::BOOT_SERVICES_CODE
            | MemoryType::BOOT_SERVICES_DATA
            | MemoryType::CONVENTIONAL
    )
}

/* ================== PCI ================== */
fn scan_pci(arena: &mut BootArena, bparm: &mut BparmList) {
    let mut io = pci::PortCfg;
    let mut n = 0u32;
    pci::scan(&mut io, &mut |locn, id, class_if| {
        info!(
            "pci {} id {:04x}:{:04x} class {:06x}",
            locn,
            id & 0xFFFF,
            id >> 16,
            class_if
        );
        let dev = PciDev {
            pci_locn: locn.raw(),
            pci_id: id,
            class_if,
            rimg_seg: 0,
            rimg_rt_seg: 0,
        };
        if bparm.add_pci_dev(arena, &dev).is_none() {
            die(Status::OUT_OF_RESOURCES, &format_args!("bparm PCID record"));
        }
        n += 1;
    });
    info!("pci: {n} function(s)");
    log_step("PCI scanned");
}

/* ================== Stage-2 image ================== */
const MAX_PHDRS: u16 = 16;

fn load_stage2() -> u32 {
    serial_line("[serial] acquiring FileSystem.");
    let image = boot::image_handle();
    let mut fs: FileSystem = match boot::get_image_file_system(image) {
        Ok(p) => {
            serial_line("[serial] FileSystem OK");
            p.into()
        }
        Err(e) => die(
            Status::LOAD_ERROR,
            &format_args!("get_image_file_system failed: {:?}", e),
        ),
    };

    let path = Path::new(cstr16!(r"\ELDBOOT\STAGE2.ELF"));
    serial_line("[serial] reading \\ELDBOOT\\STAGE2.ELF.");
    let bytes: Vec<u8> = match fs.read(path) {
        Ok(v) => {
            slog!("[serial] stage2 bytes = {}", v.len());
            v
        }
        Err(e) => die(
            Status::NOT_FOUND,
            &format_args!("read STAGE2.ELF failed: {:?}", e),
        ),
    };

    let elf = ElfFile::new(&bytes)
        .unwrap_or_else(|_| die(Status::LOAD_ERROR, &format_args!("bad stage2: ELF parse error")));
    if elf.header.pt1.class() != Class::ThirtyTwo
        || elf.header.pt1.data() != Data::LittleEndian
        || elf.header.pt2.machine().as_machine() != Machine::X86
    {
        die(
            Status::LOAD_ERROR,
            &format_args!("bad stage2: not a 32-bit x86 ELF"),
        );
    }
    if elf.header.pt2.type_().as_type() != ElfType::Executable {
        die(
            Status::LOAD_ERROR,
            &format_args!("bad stage2: not a fixed-address executable"),
        );
    }
    if elf.header.pt2.ph_count() > MAX_PHDRS {
        die(
            Status::LOAD_ERROR,
            &format_args!("bad stage2: {} program headers", elf.header.pt2.ph_count()),
        );
    }
    log_step("stage2 ELF header ok");

    // Segments land at their linked physical addresses. The firmware still
    // owns the map, so every page run is claimed before it is written;
    // abutting segments may share a page, hence the claimed_end cursor.
    let mut claimed_end = 0u64;
    for ph in elf.program_iter() {
        if ph.get_type().ok() != Some(PhType::Load) {
            continue;
        }
        let msz = ph.mem_size();
        if msz == 0 {
            continue;
        }
        let paddr = ph.physical_addr();
        let fsz = ph.file_size();
        let off = ph.offset();
        if (off + fsz) as usize > bytes.len() {
            die(
                Status::LOAD_ERROR,
                &format_args!("bad stage2: segment beyond file end"),
            );
        }
        slog!(
            "[serial] seg paddr=0x{:x} fsz=0x{:x} msz=0x{:x}",
            paddr,
            fsz,
            msz
        );
        let astart = align_down(paddr, 0x1000).max(claimed_end);
        let aend = align_up(paddr + msz, 0x1000);
        if aend > astart {
            let pages = ((aend - astart) / 0x1000) as usize;
            boot::allocate_pages(AllocateType::Address(astart), MemoryType::LOADER_DATA, pages)
                .unwrap_or_else(|e| {
                    die(
                        Status::OUT_OF_RESOURCES,
                        &format_args!("stage2 wants 0x{:x}..0x{:x}: {:?}", astart, aend, e),
                    )
                });
            claimed_end = aend;
        }
        unsafe {
            if fsz > 0 {
                ptr::copy_nonoverlapping(bytes.as_ptr().add(off as usize), paddr as *mut u8, fsz as usize);
            }
            if msz > fsz {
                ptr::write_bytes((paddr + fsz) as *mut u8, 0, (msz - fsz) as usize);
            }
        }
    }

    let entry = elf.header.pt2.entry_point();
    slog!("[serial] stage2 entry = 0x{:x}", entry);
    log_step("stage 2 loaded");
    entry as u32
}

/* ================== Handoff records ================== */
fn push_mem_ranges(arena: &mut BootArena, bparm: &mut BparmList) {
    let mm = boot::memory_map(MemoryType::LOADER_DATA)
        .unwrap_or_else(|e| die(Status::OUT_OF_RESOURCES, &format_args!("memory map: {e:?}")));
    let mut n = 0u32;
    for d in mm.entries() {
        let Some(r) = e820::convert(d.phys_start, d.page_count * 4096, d.ty.0, d.att.bits())
        else {
            continue;
        };
        if bparm.add_mem_range(arena, &r).is_none() {
            die(Status::OUT_OF_RESOURCES, &format_args!("bparm xMEM record"));
        }
        n += 1;
    }
    drop(mm);
    info!("{n} extended-memory range(s)");
}

fn alloc_trampoline() -> u64 {
    // The page address becomes a 32-bit EIP/ESP, so it must sit below 4 GiB.
    let page = boot::allocate_pages(
        AllocateType::MaxAddress(u32::MAX as u64),
        MemoryType::LOADER_CODE,
        1,
    )
    .unwrap_or_else(|e| {
        die(
            Status::OUT_OF_RESOURCES,
            &format_args!("alloc trampoline {:?}", e),
        )
    });
    page.as_ptr() as u64
}

/* ================== Logging & helpers ================== */
#[inline(always)]
fn log_step(msg: &str) {
    info!("[step] {msg}");
    boot::stall(80_000);
}
#[cold]
fn die(_: Status, msg: &core::fmt::Arguments) -> ! {
    error!("[fatal] {}", msg);
    serial_line("[serial][FATAL] abort");
    boot::stall(1_000_000);
    unsafe {
        loop {
            asm!("hlt");
        }
    }
}
#[inline]
fn align_up(x: u64, a: u64) -> u64 {
    let m = a.max(1);
    (x + m - 1) & !(m - 1)
}
#[inline]
fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}
