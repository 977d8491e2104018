// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Firmware memory map to E820 conversion.
//!
//! Legacy payloads expect INT 15h AX=E820h range descriptors. Stage 1
//! reduces the UEFI map to that vocabulary before exiting boot services;
//! everything at or below the base-memory line is dropped because the
//! `bMEM` record already describes it.

/// E820 range types a legacy consumer understands.
pub const E820_RAM: u32 = 1;
pub const E820_RESERVED: u32 = 2;
pub const E820_ACPI: u32 = 3;
pub const E820_NVS: u32 = 4;
pub const E820_PMEM: u32 = 7;

// UEFI memory type numbers (fixed by the UEFI spec).
const EFI_LOADER_CODE: u32 = 1;
const EFI_LOADER_DATA: u32 = 2;
const EFI_BOOT_SERVICES_CODE: u32 = 3;
const EFI_BOOT_SERVICES_DATA: u32 = 4;
const EFI_CONVENTIONAL: u32 = 7;
const EFI_ACPI_RECLAIM: u32 = 9;
const EFI_ACPI_NVS: u32 = 10;
const EFI_PERSISTENT: u32 = 14;

const BASE_LIMIT: u64 = 0x10_0000;

/// One extended-memory range, the `xMEM` record payload.
///
/// `e820_ext_attr` carries the ACPI 3.0 extended attribute word (bit 0 =
/// entry valid); `uefi_attr` keeps the original firmware attribute bits
/// for consumers that still care.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, packed)]
pub struct MemRange {
    pub start: u64,
    pub len: u64,
    pub e820_type: u32,
    pub e820_ext_attr: u32,
    pub uefi_attr: u64,
}

/// Map a UEFI memory type number onto an E820 type.
pub fn classify(efi_type: u32) -> u32 {
    match efi_type {
        EFI_LOADER_CODE | EFI_LOADER_DATA | EFI_BOOT_SERVICES_CODE
        | EFI_BOOT_SERVICES_DATA | EFI_CONVENTIONAL => E820_RAM,
        EFI_ACPI_RECLAIM => E820_ACPI,
        EFI_ACPI_NVS => E820_NVS,
        EFI_PERSISTENT => E820_PMEM,
        _ => E820_RESERVED,
    }
}

/// Render one firmware descriptor as an extended range, or `None` when it
/// lies wholly below the base-memory line. Descriptors straddling the line
/// are clipped up to it.
pub fn convert(start: u64, len: u64, efi_type: u32, uefi_attr: u64) -> Option<MemRange> {
    let end = start.saturating_add(len);
    if end <= BASE_LIMIT {
        return None;
    }
    let start = start.max(BASE_LIMIT);
    Some(MemRange {
        start,
        len: end - start,
        e820_type: classify(efi_type),
        e820_ext_attr: 1,
        uefi_attr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_time_types_become_ram() {
        for t in [
            EFI_LOADER_CODE,
            EFI_LOADER_DATA,
            EFI_BOOT_SERVICES_CODE,
            EFI_BOOT_SERVICES_DATA,
            EFI_CONVENTIONAL,
        ] {
            assert_eq!(classify(t), E820_RAM);
        }
        assert_eq!(classify(EFI_ACPI_RECLAIM), E820_ACPI);
        assert_eq!(classify(EFI_ACPI_NVS), E820_NVS);
        assert_eq!(classify(EFI_PERSISTENT), E820_PMEM);
        // Runtime services, MMIO, unusable, and anything unknown.
        for t in [0, 5, 6, 8, 11, 12, 13, 99] {
            assert_eq!(classify(t), E820_RESERVED);
        }
    }

    #[test]
    fn base_memory_is_dropped_or_clipped() {
        assert_eq!(convert(0, 0x9f000, EFI_CONVENTIONAL, 0), None);
        assert_eq!(convert(0xf0000, 0x10000, 0, 0), None);

        let r = convert(0xf0000, 0x20000, EFI_CONVENTIONAL, 0xf).unwrap();
        assert_eq!({ r.start }, 0x100000);
        assert_eq!({ r.len }, 0x10000);
        assert_eq!({ r.e820_type }, E820_RAM);
        assert_eq!({ r.e820_ext_attr }, 1);
        assert_eq!({ r.uefi_attr }, 0xf);
    }

    #[test]
    fn high_ranges_pass_through() {
        let r = convert(0x1_0000_0000, 0x4000_0000, EFI_ACPI_NVS, 0x8).unwrap();
        assert_eq!({ r.start }, 0x1_0000_0000);
        assert_eq!({ r.len }, 0x4000_0000);
        assert_eq!({ r.e820_type }, E820_NVS);
    }
}
