// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! GPU MMU management
//!
//! All V3D clients share one device address space, translated by a single-level page table of
//! 32-bit entries, one per 4 KiB page. This module owns that table and the allocator handing out
//! ranges of it.
//!
//! Every entry that does not belong to a mapped object points at a scratch page, and the hardware
//! is told to redirect illegal accesses there as well, so stray GPU accesses land in memory nobody
//! else uses.

use crate::bo::Bo;
use crate::debug::*;
use crate::error::{Error, Result};
use crate::hw::Hardware;
use crate::util::{align, RangeExt};
use core::ops::Range;
use parking_lot::Mutex;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Mmu;

/// MMU page size.
pub const PAGE_SIZE: usize = 4096;
const PAGE_SHIFT: u32 = 12;

/// Alignment of every allocation, in bytes. The GMP protects memory at this granularity.
pub const GMP_GRANULARITY: usize = 128 * 1024;
const GMP_PAGES: u32 = (GMP_GRANULARITY / PAGE_SIZE) as u32;

const PTE_WRITEABLE: u32 = 1 << 29;
const PTE_VALID: u32 = 1 << 28;
const PTE_PFN_MASK: u32 = PTE_VALID - 1;

fn pte(paddr: u64) -> u32 {
    PTE_VALID | PTE_WRITEABLE | ((paddr >> PAGE_SHIFT) as u32 & PTE_PFN_MASK)
}

struct MmuInner {
    page_table: Vec<u32>,
    /// Free page ranges, sorted and never adjacent.
    free: Vec<Range<u32>>,
    mapped_bos: usize,
    mapped_pages: usize,
}

impl MmuInner {
    /// Best-fit search for `pages` pages starting on a GMP boundary.
    fn alloc(&mut self, pages: u32) -> Option<Range<u32>> {
        let mut best: Option<(usize, u32, u32)> = None;

        for (i, range) in self.free.iter().enumerate() {
            let start = align(range.start, GMP_PAGES);
            let end = match start.checked_add(pages) {
                Some(end) if end <= range.end => end,
                _ => continue,
            };
            let waste = range.range() - (end - start);
            if best.map_or(true, |(_, _, w)| waste < w) {
                best = Some((i, start, waste));
            }
            if waste == 0 {
                break;
            }
        }

        let (i, start, _) = best?;
        let hole = self.free.remove(i);
        let node = start..start + pages;
        let mut pos = i;
        if hole.start < node.start {
            self.free.insert(pos, hole.start..node.start);
            pos += 1;
        }
        if node.end < hole.end {
            self.free.insert(pos, node.end..hole.end);
        }
        Some(node)
    }

    fn free(&mut self, node: Range<u32>) -> Result {
        let pos = self.free.partition_point(|r| r.start < node.start);

        let prev_overlaps = pos > 0 && self.free[pos - 1].overlaps(node.clone());
        let next_overlaps = pos < self.free.len() && self.free[pos].overlaps(node.clone());
        if prev_overlaps || next_overlaps {
            pr_err!("MMU: double free of pages {:#x?}", node);
            return Err(Error::InternalConsistency("page range freed twice"));
        }

        let merge_prev = pos > 0 && self.free[pos - 1].end == node.start;
        let merge_next = pos < self.free.len() && self.free[pos].start == node.end;
        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.free.remove(pos);
                self.free[pos - 1].end = next.end;
            }
            (true, false) => self.free[pos - 1].end = node.end,
            (false, true) => self.free[pos].start = node.start,
            (false, false) => self.free.insert(pos, node),
        }
        Ok(())
    }
}

/// The device address space.
pub struct Mmu {
    hw: Arc<dyn Hardware>,
    /// Bus address of the page table.
    pt_base: u64,
    /// Bus address of the scratch page.
    scratch: u64,
    num_pages: u32,
    inner: Mutex<MmuInner>,
}

impl Mmu {
    /// Allocate the page table and scratch page for a `va_width`-bit address space and point the
    /// hardware at them.
    pub(crate) fn new(hw: Arc<dyn Hardware>, va_width: u32) -> Result<Arc<Mmu>> {
        if !(PAGE_SHIFT + 5..=32).contains(&va_width) {
            cls_pr_debug!(Errors, "MMU: unsupported VA width {}", va_width);
            return Err(Error::InvalidArgument("VA width"));
        }
        let num_pages = ((1u64 << va_width) >> PAGE_SHIFT) as u32;
        let pt_bytes = num_pages as usize * core::mem::size_of::<u32>();

        let pt_base = hw.alloc_coherent(pt_bytes.div_ceil(PAGE_SIZE))?;
        let scratch = hw.alloc_coherent(1)?;

        let mmu = Arc::new(Mmu {
            hw,
            pt_base,
            scratch,
            num_pages,
            inner: Mutex::new(MmuInner {
                page_table: vec![pte(scratch); num_pages as usize],
                // Device address 0 is never handed out.
                free: vec![1..num_pages],
                mapped_bos: 0,
                mapped_pages: 0,
            }),
        });

        mod_pr_debug!(
            "MMU: {} pages, page table at {:#x}, scratch at {:#x}",
            num_pages,
            pt_base,
            scratch
        );
        mmu.set_page_table()?;
        Ok(mmu)
    }

    /// Program the page table root and the illegal-access redirect. Also needed after a reset.
    pub(crate) fn set_page_table(&self) -> Result {
        self.hw.mmu_set_page_table(self.pt_base, self.scratch)?;
        self.hw.mmu_flush()
    }

    /// Map `bo` at a freshly allocated device address range. Returns its base address.
    pub fn map(&self, bo: &Bo) -> Result<u32> {
        let pages = bo.pages();
        if pages.is_empty() {
            cls_pr_debug!(Errors, "MMU: cannot map an empty object");
            return Err(Error::InvalidArgument("empty object"));
        }
        let count: u32 = pages
            .len()
            .try_into()
            .map_err(|_| Error::NoSpace)?;

        let mut inner = self.inner.lock();
        let mut node = bo.node.lock();
        if node.is_some() {
            cls_pr_debug!(Errors, "MMU: object is already mapped");
            return Err(Error::Busy);
        }

        let range = inner.alloc(count).ok_or_else(|| {
            cls_pr_debug!(Errors, "MMU: no room for {} pages", count);
            Error::NoSpace
        })?;
        if !(0..self.num_pages).is_superset(range.clone()) {
            return Err(Error::InternalConsistency("allocation outside address space"));
        }

        for (entry, paddr) in inner.page_table[range.start as usize..range.end as usize]
            .iter_mut()
            .zip(pages)
        {
            *entry = pte(*paddr);
        }
        inner.mapped_bos += 1;
        inner.mapped_pages += pages.len();

        let addr = range.start << PAGE_SHIFT;
        mod_pr_debug!("MMU: mapped {} pages at {:#x}", count, addr);
        *node = Some(range);
        core::mem::drop(node);
        core::mem::drop(inner);

        self.hw.mmu_flush()?;
        Ok(addr)
    }

    /// Remove the mapping of `bo` and return its range to the allocator.
    ///
    /// Fails with `Busy` while a job has the object pinned.
    pub fn unmap(&self, bo: &Bo) -> Result {
        let mut inner = self.inner.lock();
        let mut node = bo.node.lock();
        if *bo.pins.lock() != 0 {
            cls_pr_debug!(Errors, "MMU: cannot unmap a pinned object");
            return Err(Error::Busy);
        }
        let range = node.take().ok_or(Error::NoEntry)?;
        core::mem::drop(node);

        let scratch = pte(self.scratch);
        for entry in &mut inner.page_table[range.start as usize..range.end as usize] {
            *entry = scratch;
        }
        inner.mapped_bos -= 1;
        inner.mapped_pages -= range.range() as usize;

        mod_pr_debug!(
            "MMU: unmapped {} pages at {:#x}",
            range.range(),
            range.start << PAGE_SHIFT
        );
        inner.free(range)?;
        core::mem::drop(inner);

        self.hw.mmu_flush()
    }

    /// Snapshot of the free page ranges, lowest first.
    pub fn free_ranges(&self) -> Vec<Range<u32>> {
        self.inner.lock().free.clone()
    }

    pub fn mapped_bos(&self) -> usize {
        self.inner.lock().mapped_bos
    }

    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().mapped_pages
    }

    /// Page table entry translating device address `addr`.
    pub fn pte(&self, addr: u32) -> Option<u32> {
        self.inner
            .lock()
            .page_table
            .get((addr >> PAGE_SHIFT) as usize)
            .copied()
    }

    /// Page table entry of an unmapped page.
    pub fn scratch_pte(&self) -> u32 {
        pte(self.scratch)
    }

    /// Size of the address space, in pages.
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }
}
