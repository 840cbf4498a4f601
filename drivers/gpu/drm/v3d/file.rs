// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! File implementation, which represents a single client.
//!
//! A `File` owns the handles of one client: buffer objects and perfmons, both keyed by small
//! integer ids starting at 1. Submissions resolve their handles through the file they come from
//! (see the `queue` submodules for the submit entry points).

use crate::bo::Bo;
use crate::debug::*;
use crate::device::V3dDevice;
use crate::error::{Error, Result};
use crate::fence::WaitStatus;
use crate::perfmon::Perfmon;
use crate::queue::Queue;
use crate::stats::PidStats;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::File;

/// State associated with a client.
pub struct File {
    dev: Arc<V3dDevice>,
    id: u64,
    pid: u32,
    bos: Mutex<BTreeMap<u32, Arc<Bo>>>,
    perfmons: Mutex<BTreeMap<u32, Arc<Perfmon>>>,
    next_bo: AtomicU32,
    next_perfmon: AtomicU32,
}

impl File {
    /// Create a new `File` instance for a client running as process `pid`.
    pub fn open(dev: &Arc<V3dDevice>, pid: u32) -> File {
        let id = dev.ids().file.next();
        mod_dev_dbg!(dev, "[File {}]: opened by pid {}", id, pid);
        File {
            dev: dev.clone(),
            id,
            pid,
            bos: Mutex::new(BTreeMap::new()),
            perfmons: Mutex::new(BTreeMap::new()),
            next_bo: AtomicU32::new(1),
            next_perfmon: AtomicU32::new(1),
        }
    }

    pub(crate) fn dev(&self) -> &Arc<V3dDevice> {
        &self.dev
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn bos(&self) -> &Mutex<BTreeMap<u32, Arc<Bo>>> {
        &self.bos
    }

    pub(crate) fn perfmons(&self) -> &Mutex<BTreeMap<u32, Arc<Perfmon>>> {
        &self.perfmons
    }

    /// Allocate and map a buffer object of `size` bytes. Returns its handle.
    pub fn bo_create(&self, size: usize) -> Result<u32> {
        if size == 0 {
            cls_pr_debug!(Errors, "bo_create: zero size");
            return Err(Error::InvalidArgument("zero-sized object"));
        }
        let bo = self.dev.alloc_bo(size.div_ceil(crate::mmu::PAGE_SIZE))?;
        Ok(self.add_bo(bo))
    }

    /// Wrap existing physical pages in a buffer object. Returns its handle.
    pub fn bo_import(&self, pages: Vec<u64>) -> Result<u32> {
        let bo = Bo::new(self.dev.mmu(), pages)?;
        Ok(self.add_bo(bo))
    }

    fn add_bo(&self, bo: Arc<Bo>) -> u32 {
        let handle = self.next_bo.fetch_add(1, Ordering::Relaxed);
        mod_dev_dbg!(
            self.dev,
            "[File {}]: object {} at {:?} ({} bytes)",
            self.id,
            handle,
            bo.offset(),
            bo.size()
        );
        self.bos.lock().insert(handle, bo);
        handle
    }

    /// Device address of an object.
    pub fn bo_offset(&self, handle: u32) -> Result<u32> {
        self.bos
            .lock()
            .get(&handle)
            .and_then(|bo| bo.offset())
            .ok_or(Error::NoEntry)
    }

    /// Wait until no submitted job uses the object, or `timeout` passes.
    pub fn bo_wait(&self, handle: u32, timeout: Duration) -> Result<WaitStatus> {
        let bo = self.bos.lock().get(&handle).cloned().ok_or(Error::NoEntry)?;
        Ok(bo.wait_idle(timeout))
    }

    /// Drop the handle. The object itself goes away once no job uses it.
    pub fn bo_close(&self, handle: u32) -> Result {
        let bo = self.bos.lock().remove(&handle).ok_or(Error::NoEntry)?;
        mod_dev_dbg!(
            self.dev,
            "[File {}]: closing object {} (pinned: {})",
            self.id,
            handle,
            bo.is_pinned()
        );
        Ok(())
    }

    /// Create a perfmon counting `counters`. Returns its id.
    pub fn perfmon_create(&self, counters: &[u8]) -> Result<u32> {
        let perfmon = self.dev.new_perfmon(counters)?;
        let id = self.next_perfmon.fetch_add(1, Ordering::Relaxed);
        mod_dev_dbg!(self.dev, "[File {}]: perfmon {} {:?}", self.id, id, perfmon);
        self.perfmons.lock().insert(id, perfmon);
        Ok(id)
    }

    /// Destroy a perfmon. If it is counting, it is stopped and the counts are discarded.
    pub fn perfmon_destroy(&self, id: u32) -> Result {
        let perfmon = self.perfmons.lock().remove(&id).ok_or(Error::NoEntry)?;
        self.dev.perfmon_stop(&perfmon, false);
        Ok(())
    }

    /// Accumulated values of a perfmon.
    pub fn perfmon_get_values(&self, id: u32) -> Result<Vec<u64>> {
        self.perfmons
            .lock()
            .get(&id)
            .map(|perfmon| perfmon.read())
            .ok_or(Error::NoEntry)
    }

    /// Per-process usage of `queue`, for all clients.
    pub fn pid_stats(&self, queue: Queue) -> Vec<PidStats> {
        self.dev.pid_stats(queue)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        mod_pr_debug!("[File {}]: Closing...", self.id);
        let perfmons = core::mem::take(self.perfmons.get_mut());
        for perfmon in perfmons.values() {
            self.dev.perfmon_stop(perfmon, false);
        }
        self.bos.get_mut().clear();
    }
}
