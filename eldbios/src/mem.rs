// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Stage-2 heap and physical-memory access.
//!
//! The `bMEM` record stage 1 sealed into the parameter list bounds the
//! window of base memory that survived the handoff: everything from the
//! boot-time low-water mark up to the runtime top is ours. The whole
//! window becomes the heap.

use core::ptr::NonNull;

use eldcore::acpi::TableMapper;
use eldcore::bparm::{BP_BMEM, BmemRange, Records};
use linked_list_allocator::LockedHeap;
use log::info;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Hand the base-memory window to the allocator. Panics when the list
/// carries no `bMEM` record; nothing downstream can run without a heap.
pub fn init(bparm_head: u64) {
    let mut window = None;
    for rec in unsafe { Records::new(bparm_head) } {
        if rec.tag() == BP_BMEM {
            window = unsafe { rec.payload::<BmemRange>() };
        }
    }
    let Some(range) = window else {
        panic!("boot parameters carry no bMEM record");
    };
    let bot = (range.boottime_bot_seg as usize) << 4;
    let top = (range.runtime_top_seg as usize) << 4;
    if bot >= top {
        panic!("bMEM window {bot:#x}..{top:#x} is inside out");
    }
    unsafe {
        HEAP.lock().init(bot as *mut u8, top - bot);
    }
    info!("heap: {} KiB at {:#07x}..{:#07x}", (top - bot) / 1024, bot, top);
}

/// Physical access through the boot identity map: the low 4 GiB are
/// mapped 1:1 with 2 MiB pages, so "mapping" a table is a bounds check.
pub struct IdentityMapper {
    limit: u64,
}

impl IdentityMapper {
    pub const fn new() -> Self {
        Self { limit: 1 << 32 }
    }
}

impl TableMapper for IdentityMapper {
    fn map(&self, phys: u64, len: usize) -> Option<NonNull<u8>> {
        let end = phys.checked_add(len as u64)?;
        if phys == 0 || end > self.limit {
            return None;
        }
        NonNull::new(phys as *mut u8)
    }

    fn unmap(&self, _ptr: NonNull<u8>, _phys: u64, _len: usize) {}
}
