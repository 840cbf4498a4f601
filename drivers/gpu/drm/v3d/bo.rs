// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Buffer objects
//!
//! A `Bo` is a run of physical pages mapped into the device address space for as long as it
//! lives. Jobs pin the objects they reference with a `BoPin`; a pinned object cannot be unmapped,
//! and since the pin holds a reference the object also outlives every job using it.
//!
//! Pinning happens under the object's mapping lock, the same lock `Mmu::unmap` checks the pin
//! count under, so an object is never unmapped between being pinned and being used.

use crate::debug::*;
use crate::error::{Error, Result};
use crate::fence::WaitStatus;
use crate::mmu::{Mmu, PAGE_SIZE};
use core::ops::Range;
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

const DEBUG_CLASS: DebugFlags = DebugFlags::Bo;

/// A device-visible buffer object.
pub struct Bo {
    mmu: Arc<Mmu>,
    /// Physical address of each 4 KiB page.
    pages: Vec<u64>,
    /// Device page range, while mapped.
    pub(crate) node: Mutex<Option<Range<u32>>>,
    /// Number of jobs holding the object. Taken after `node`.
    pub(crate) pins: Mutex<u32>,
    idle: Condvar,
}

impl Bo {
    /// Create an object over `pages` and map it.
    pub fn new(mmu: &Arc<Mmu>, pages: Vec<u64>) -> Result<Arc<Bo>> {
        let bo = Arc::new(Bo {
            mmu: mmu.clone(),
            pages,
            node: Mutex::new(None),
            pins: Mutex::new(0),
            idle: Condvar::new(),
        });
        mmu.map(&bo)?;
        Ok(bo)
    }

    /// Create an object over a physically contiguous range starting at `paddr`.
    pub fn new_contiguous(mmu: &Arc<Mmu>, paddr: u64, num_pages: usize) -> Result<Arc<Bo>> {
        let pages = (0..num_pages as u64)
            .map(|i| paddr + i * PAGE_SIZE as u64)
            .collect();
        Bo::new(mmu, pages)
    }

    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// Device address of the object, if it is mapped.
    pub fn offset(&self) -> Option<u32> {
        self.node.lock().as_ref().map(|r| r.start << 12)
    }

    pub fn is_pinned(&self) -> bool {
        *self.pins.lock() != 0
    }

    /// Block until no job holds the object, or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        let mut pins = self.pins.lock();
        while *pins != 0 {
            if self.idle.wait_until(&mut pins, deadline).timed_out() {
                break;
            }
        }
        if *pins == 0 {
            WaitStatus::Signaled
        } else {
            WaitStatus::TimedOut
        }
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        if self.node.get_mut().is_some() && self.mmu.unmap(self).is_err() {
            pr_err!("Bo::drop: unmap failed");
        }
    }
}

impl core::fmt::Debug for Bo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bo")
            .field("pages", &self.pages.len())
            .field("offset", &self.offset())
            .field("pins", &*self.pins.lock())
            .finish()
    }
}

/// Keeps a `Bo` resident for the duration of a job.
pub(crate) struct BoPin(Arc<Bo>);

impl BoPin {
    /// Pin `bo`. Fails with `NoEntry` if it is not mapped.
    pub(crate) fn new(bo: &Arc<Bo>) -> Result<BoPin> {
        let node = bo.node.lock();
        let Some(range) = node.as_ref() else {
            cls_pr_debug!(Errors, "BoPin: object is not mapped");
            return Err(Error::NoEntry);
        };
        let mut pins = bo.pins.lock();
        *pins += 1;
        mod_pr_debug!("Pinned pages {:#x?} (pins: {})", range, *pins);
        core::mem::drop(pins);
        core::mem::drop(node);
        Ok(BoPin(bo.clone()))
    }
}

impl Drop for BoPin {
    fn drop(&mut self) {
        let mut pins = self.0.pins.lock();
        *pins -= 1;
        if *pins == 0 {
            self.0.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimGpu;
    use std::thread;

    #[test]
    fn lifetime_drives_the_mapping() {
        let mmu = Mmu::new(Arc::new(SimGpu::new()), 24).unwrap();
        let before = mmu.free_ranges();

        let bo = Bo::new_contiguous(&mmu, 0x8000_0000, 4).unwrap();
        let addr = bo.offset().unwrap();
        assert_eq!(bo.size(), 4 * PAGE_SIZE);
        assert_eq!(mmu.mapped_bos(), 1);
        assert_eq!(mmu.mapped_pages(), 4);
        assert_ne!(mmu.pte(addr), Some(mmu.scratch_pte()));

        drop(bo);
        assert_eq!(mmu.mapped_bos(), 0);
        assert_eq!(mmu.pte(addr), Some(mmu.scratch_pte()));
        assert_eq!(mmu.free_ranges(), before);
    }

    #[test]
    fn pinned_objects_cannot_be_unmapped() {
        let mmu = Mmu::new(Arc::new(SimGpu::new()), 24).unwrap();
        let bo = Bo::new_contiguous(&mmu, 0x8000_0000, 1).unwrap();

        let pin = BoPin::new(&bo).unwrap();
        assert!(bo.is_pinned());
        assert_eq!(bo.wait_idle(Duration::ZERO), WaitStatus::TimedOut);
        assert!(matches!(mmu.unmap(&bo), Err(Error::Busy)));

        drop(pin);
        assert_eq!(bo.wait_idle(Duration::ZERO), WaitStatus::Signaled);
        mmu.unmap(&bo).unwrap();
        assert_eq!(bo.offset(), None);
        assert!(matches!(mmu.unmap(&bo), Err(Error::NoEntry)));
        assert!(matches!(BoPin::new(&bo), Err(Error::NoEntry)));
        assert!(!bo.is_pinned());
        assert_eq!(mmu.map(&bo).unwrap() % GMP_BYTES, 0);
    }

    #[test]
    fn waiters_wake_when_the_last_pin_goes() {
        let mmu = Mmu::new(Arc::new(SimGpu::new()), 24).unwrap();
        let bo = Bo::new_contiguous(&mmu, 0x8000_0000, 1).unwrap();
        let first = BoPin::new(&bo).unwrap();
        let second = BoPin::new(&bo).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| bo.wait_idle(Duration::from_secs(10)));
            drop(first);
            drop(second);
            assert_eq!(waiter.join().unwrap(), WaitStatus::Signaled);
        });
    }

    const GMP_BYTES: u32 = crate::mmu::GMP_GRANULARITY as u32;
}
