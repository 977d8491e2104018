// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Firmware glue for the shared base-memory pool.

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use eldcore::bmem::{BmemPool, PageClaimer};
use eldcore::bparm::BparmArena;
use uefi::boot::{self, AllocateType, MemoryType};

/// Grabs page runs below a physical limit straight from boot services.
pub struct FirmwareClaimer;

impl PageClaimer for FirmwareClaimer {
    fn claim_below(&mut self, limit: u64, pages: usize) -> Option<u64> {
        // MaxAddress bounds the last byte of the run, not its start
        boot::allocate_pages(
            AllocateType::MaxAddress(limit - 1),
            MemoryType::LOADER_DATA,
            pages,
        )
        .ok()
        .map(|p| p.as_ptr() as u64)
    }
}

/// The pool, wearing the arena hat the boot-parameter list wants. Base
/// memory is identity-mapped while boot services run, so the physical
/// address doubles as the pointer.
pub struct BootArena(pub BmemPool);

unsafe impl BparmArena for BootArena {
    fn alloc_boottime(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let addr = self.0.alloc_boottime(size as u32, align as u32).ok()?;
        NonNull::new(addr as *mut u8)
    }
}

impl Deref for BootArena {
    type Target = BmemPool;
    fn deref(&self) -> &BmemPool {
        &self.0
    }
}
impl DerefMut for BootArena {
    fn deref_mut(&mut self) -> &mut BmemPool {
        &mut self.0
    }
}
