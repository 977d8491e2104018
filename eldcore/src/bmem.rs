// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Base-memory (< 1 MiB) allocator.
//!
//! Legacy real-mode code needs the bottom megabyte, but UEFI firmware owns
//! it. Stage 1 grabs every free page down there through the firmware
//! allocator, then hands them out in two classes: run-time allocations
//! carved from the top (they survive into stage 2's "BIOS" environment)
//! and boot-time allocations carved from the bottom (the boot-parameter
//! list and other stage-1 scratch, reclaimed wholesale once stage 2 owns
//! the machine).

use heapless::Vec as HVec;
use log::{info, warn};

/// Base memory holds at most 1 MiB / 4 KiB / 2 blocks of free space.
pub const MAX_BLOCKS: usize = 128;

const PAGE_SIZE: u32 = 4096;
const BASE_PAGES: usize = 256;
const BASE_LIMIT: u64 = 0x10_0000;

/// The run-time zone must keep at least this much to fake a base-memory
/// size a legacy payload will accept.
const MIN_RUNTIME: u32 = 192 * 1024;
/// And at least this much of it must still be free after boot-time use.
const MIN_MARGIN: u32 = 128 * 1024;

/// First usable byte; page 0 stays out of the pool for the IVT and BDA.
const BOT_START: u32 = 0x1000;

/// One free extent, `start..end`, page-aligned at birth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub start: u32,
    pub end: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BmemError {
    /// Not enough contiguous base memory to fake a legacy machine.
    TooLittle,
    /// No block can satisfy a run-time allocation.
    Exhausted,
    /// A boot-time allocation would land inside the run-time zone.
    Collision,
}

/// Claims pages from the platform allocator during `BmemPool::init`.
pub trait PageClaimer {
    /// Claim `pages` contiguous pages lying wholly below `limit`; returns
    /// the physical start address, or `None` when no such run exists.
    fn claim_below(&mut self, limit: u64, pages: usize) -> Option<u64>;
}

/// Free-block table plus the two high-water marks.
///
/// `boottime_bot` only ever grows, `runtime_top` only ever shrinks; the
/// window between them is the scratch zone stage 2 reclaims as its heap.
#[derive(Debug)]
pub struct BmemPool {
    blocks: HVec<Block, MAX_BLOCKS>,
    boottime_bot: u32,
    runtime_top: u32,
}

impl BmemPool {
    /// Take ownership of free base memory.
    ///
    /// `map_ranges` are the firmware-map extents (start, len) that become
    /// free at exit-boot-services time (loader and boot-services types plus
    /// conventional memory). They count toward the contiguous run that sets
    /// `runtime_top`, but are never handed out here: the firmware still
    /// owns them while stage 1 runs.
    pub fn init<C: PageClaimer>(
        claimer: &mut C,
        map_ranges: impl IntoIterator<Item = (u64, u64)>,
    ) -> Result<Self, BmemError> {
        let mut avail = [false; BASE_PAGES];

        // 1. Exhaustive grab: ask big, halve on refusal, stop at zero.
        // A successful claim keeps the request size for the next round.
        let mut pages = 128usize;
        while pages > 0 {
            match claimer.claim_below(BASE_LIMIT, pages) {
                Some(start) => {
                    let first = (start / PAGE_SIZE as u64) as usize;
                    for p in first..(first + pages).min(BASE_PAGES) {
                        avail[p] = true;
                    }
                }
                None => pages /= 2,
            }
        }

        // 2. Coalesce the claimed pages into the block table. Page 0 is
        // never handed out even if the firmware gave it to us.
        let mut blocks: HVec<Block, MAX_BLOCKS> = HVec::new();
        let mut run: Option<Block> = None;
        for p in 1..BASE_PAGES {
            let addr = p as u32 * PAGE_SIZE;
            match (&mut run, avail[p]) {
                (None, true) => run = Some(Block { start: addr, end: addr + PAGE_SIZE }),
                (Some(b), true) => b.end = addr + PAGE_SIZE,
                (Some(b), false) => {
                    if blocks.push(*b).is_err() {
                        warn!("bmem: block table full, dropping {:#x}..{:#x}", b.start, b.end);
                    }
                    run = None;
                }
                (None, false) => {}
            }
        }
        if let Some(b) = run {
            if blocks.push(b).is_err() {
                warn!("bmem: block table full, dropping {:#x}..{:#x}", b.start, b.end);
            }
        }

        // 3. Fold in the map extents. Bitmap only: they extend the
        // contiguous run measured below but must not enter the table.
        for (start, len) in map_ranges {
            let end = start.saturating_add(len).min(BASE_LIMIT);
            let mut p = (start / PAGE_SIZE as u64) as usize;
            while (p as u64) * PAGE_SIZE as u64 + PAGE_SIZE as u64 <= end && p < BASE_PAGES {
                avail[p] = true;
                p += 1;
            }
        }

        // 4. runtime_top = end of the contiguous available run from 0.
        let run_pages = avail.iter().take_while(|a| **a).count();
        let runtime_top = run_pages as u32 * PAGE_SIZE;

        for b in &blocks {
            info!("bmem: free {:#07x}..{:#07x} ({} KiB)", b.start, b.end, (b.end - b.start) / 1024);
        }
        info!("bmem: contiguous from 0: {} KiB", runtime_top / 1024);

        let pool = Self { blocks, boottime_bot: BOT_START, runtime_top };
        pool.check_margins()?;
        Ok(pool)
    }

    fn check_margins(&self) -> Result<(), BmemError> {
        if self.runtime_top < MIN_RUNTIME || self.boottime_bot > self.runtime_top - MIN_MARGIN {
            return Err(BmemError::TooLittle);
        }
        Ok(())
    }

    /// Run-time allocation: carved from the top of the highest fitting
    /// block, persists into stage 2.
    pub fn alloc(&mut self, size: u32, align: u32) -> Result<u32, BmemError> {
        debug_assert!(align.is_power_of_two());
        for i in (0..self.blocks.len()).rev() {
            let b = self.blocks[i];
            let Some(astart) = b.end.checked_sub(size).map(|a| a & !(align - 1)) else {
                continue;
            };
            if astart < b.start {
                continue;
            }
            if self.runtime_top > astart {
                self.runtime_top = astart;
            }
            if astart == b.start {
                self.blocks.remove(i);
            } else {
                self.blocks[i].end = astart;
            }
            return Ok(astart);
        }
        Err(BmemError::Exhausted)
    }

    /// Boot-time allocation: carved from the bottom of the lowest fitting
    /// block, reclaimed when stage 2 takes over.
    pub fn alloc_boottime(&mut self, size: u32, align: u32) -> Result<u32, BmemError> {
        debug_assert!(align.is_power_of_two());
        for i in 0..self.blocks.len() {
            let b = self.blocks[i];
            let astart = (b.start + align - 1) & !(align - 1);
            if astart > b.end || b.end - astart < size {
                continue;
            }
            if astart >= self.runtime_top {
                // Lowest free space already inside the run-time zone:
                // the two zones have met and the layout is unusable.
                return Err(BmemError::Collision);
            }
            let aend = astart + size;
            if self.boottime_bot < aend {
                self.boottime_bot = aend;
            }
            if aend == b.end {
                self.blocks.remove(i);
            } else {
                // The aligned-away sliver below `astart` sits under the
                // boot-time mark now and is spoken for either way.
                self.blocks[i].start = aend;
            }
            return Ok(astart);
        }
        Err(BmemError::Exhausted)
    }

    /// Seal the pool for handoff: paragraph-align the boot-time mark,
    /// KiB-align the run-time mark, re-check the margins and return
    /// `(boottime_bot, runtime_top)`.
    pub fn fini(&mut self) -> Result<(u32, u32), BmemError> {
        self.boottime_bot = (self.boottime_bot + 15) & !15;
        self.runtime_top &= !1023;
        self.check_margins()?;
        Ok((self.boottime_bot, self.runtime_top))
    }

    pub fn boottime_bot(&self) -> u32 {
        self.boottime_bot
    }

    pub fn runtime_top(&self) -> u32 {
        self.runtime_top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Firmware-allocator stand-in over a 256-page ownership map.
    /// Claims the highest fitting run, like real firmware tends to.
    struct FakeFirmware {
        free: [bool; BASE_PAGES],
    }

    impl FakeFirmware {
        fn with_free_pages(ranges: &[core::ops::Range<usize>]) -> Self {
            let mut free = [false; BASE_PAGES];
            for r in ranges {
                for p in r.clone() {
                    free[p] = true;
                }
            }
            Self { free }
        }
    }

    impl PageClaimer for FakeFirmware {
        fn claim_below(&mut self, limit: u64, pages: usize) -> Option<u64> {
            let cap = (limit / PAGE_SIZE as u64) as usize;
            let cap = cap.min(BASE_PAGES);
            let mut run = 0;
            let mut best = None;
            for p in 0..cap {
                run = if self.free[p] { run + 1 } else { 0 };
                if run >= pages {
                    best = Some(p + 1 - pages);
                }
            }
            let start = best?;
            for p in start..start + pages {
                self.free[p] = false;
            }
            Some(start as u64 * PAGE_SIZE as u64)
        }
    }

    fn no_ranges() -> impl Iterator<Item = (u64, u64)> {
        core::iter::empty()
    }

    #[test]
    fn init_accepts_200k_run_and_rejects_100k() {
        // 200 KiB contiguous from 0 = 50 pages.
        let mut fw = FakeFirmware::with_free_pages(&[0..50]);
        let pool = BmemPool::init(&mut fw, no_ranges()).unwrap();
        assert_eq!(pool.runtime_top(), 50 * 4096);
        assert_eq!(pool.boottime_bot(), 0x1000);

        // 100 KiB contiguous from 0 = 25 pages.
        let mut fw = FakeFirmware::with_free_pages(&[0..25]);
        assert_eq!(
            BmemPool::init(&mut fw, no_ranges()).unwrap_err(),
            BmemError::TooLittle
        );
    }

    #[test]
    fn map_ranges_extend_the_run_but_not_the_table() {
        // Firmware will only give us pages 32..64; pages 0..32 belong to
        // boot-services data that frees up later. The run from 0 counts
        // both, the block table only the claimed half.
        let mut fw = FakeFirmware::with_free_pages(&[32..64]);
        let pool = BmemPool::init(&mut fw, [(0u64, 32 * 4096u64)]).unwrap();
        assert_eq!(pool.runtime_top(), 64 * 4096);
        assert_eq!(pool.blocks.len(), 1);
        assert_eq!(pool.blocks[0], Block { start: 32 * 4096, end: 64 * 4096 });
    }

    #[test]
    fn page_zero_never_enters_the_table() {
        let mut fw = FakeFirmware::with_free_pages(&[0..64]);
        let pool = BmemPool::init(&mut fw, no_ranges()).unwrap();
        assert_eq!(pool.blocks[0].start, 0x1000);
        // It still counts toward the contiguous run.
        assert_eq!(pool.runtime_top(), 64 * 4096);
    }

    #[test]
    fn allocations_are_disjoint_and_inside_free_memory() {
        let mut fw = FakeFirmware::with_free_pages(&[0..64, 80..128]);
        let originally_free = fw.free;
        let mut pool = BmemPool::init(&mut fw, no_ranges()).unwrap();

        let mut got: Vec<(u32, u32)> = Vec::new();
        for (size, align, boottime) in [
            (0x1000u32, 0x1000u32, false),
            (0x400, 0x10, true),
            (0x2000, 0x1000, false),
            (0x31, 0x4, true),
            (0x800, 0x800, false),
            (0x1000, 0x1000, true),
        ] {
            let start = if boottime {
                pool.alloc_boottime(size, align).unwrap()
            } else {
                pool.alloc(size, align).unwrap()
            };
            assert_eq!(start % align, 0);
            got.push((start, start + size));
        }

        for (i, a) in got.iter().enumerate() {
            // Inside originally-free pages, page 0 excluded.
            for p in (a.0 / 4096)..(a.1 - 1) / 4096 + 1 {
                assert!(p > 0 && originally_free[p as usize], "alloc {i} outside free memory");
            }
            // Pairwise disjoint.
            for (j, b) in got.iter().enumerate() {
                if i != j {
                    assert!(a.1 <= b.0 || b.1 <= a.0, "allocs {i} and {j} overlap");
                }
            }
        }
    }

    #[test]
    fn marks_move_monotonically_and_fini_orders_them() {
        let mut fw = FakeFirmware::with_free_pages(&[0..128]);
        let mut pool = BmemPool::init(&mut fw, no_ranges()).unwrap();

        let mut bot = pool.boottime_bot();
        let mut top = pool.runtime_top();
        for i in 0..12 {
            if i % 2 == 0 {
                pool.alloc(0x500, 0x10).unwrap();
            } else {
                pool.alloc_boottime(0x700, 0x20).unwrap();
            }
            assert!(pool.boottime_bot() >= bot);
            assert!(pool.runtime_top() <= top);
            bot = pool.boottime_bot();
            top = pool.runtime_top();
        }

        let (bot, top) = pool.fini().unwrap();
        assert!(bot <= top);
        assert_eq!(bot % 16, 0);
        assert_eq!(top % 1024, 0);
    }

    #[test]
    fn runtime_alloc_carves_from_the_top() {
        let mut fw = FakeFirmware::with_free_pages(&[0..64]);
        let mut pool = BmemPool::init(&mut fw, no_ranges()).unwrap();
        let top_before = pool.runtime_top();
        let a = pool.alloc(0x1000, 0x1000).unwrap();
        assert_eq!(a, top_before - 0x1000);
        assert_eq!(pool.runtime_top(), a);
    }

    #[test]
    fn boottime_alloc_collision_with_runtime_zone_is_fatal() {
        // A block above a hole sits past runtime_top; once the low block
        // is gone, bottom-up allocation reaching it must refuse.
        let mut fw = FakeFirmware::with_free_pages(&[0..50, 60..64]);
        let mut pool = BmemPool::init(&mut fw, no_ranges()).unwrap();
        assert_eq!(pool.runtime_top(), 50 * 4096);
        while pool.alloc_boottime(0x1000, 0x1000).is_ok() {}
        assert_eq!(
            pool.alloc_boottime(0x1000, 0x1000).unwrap_err(),
            BmemError::Collision
        );
    }

    #[test]
    fn exhaustion_reports_instead_of_wrapping() {
        let mut fw = FakeFirmware::with_free_pages(&[0..64]);
        let mut pool = BmemPool::init(&mut fw, no_ranges()).unwrap();
        assert_eq!(pool.alloc(0x4000_0000, 0x1000).unwrap_err(), BmemError::Exhausted);
    }
}
