// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! V3D device
//!
//! `V3dDevice` owns all per-GPU state: the address space, the queue slots and their waiting jobs,
//! the per-queue fence contexts, the perfmon owning the counters and the accounting tables. Nothing
//! is global; every operation goes through a device reference.
//!
//! Lock ordering. When more than one of these is held, they are taken in this order and never in
//! reverse:
//!
//! 1. `slots` (the submission lock)
//! 2. an entity FIFO
//! 3. the MMU
//! 4. `cache_clean`
//! 5. the active perfmon
//! 6. a perfmon's values
//! 7. a queue's accounting table
//!
//! Fence context and job fence locks are leaves. `slots` is held across the reset sequence, which
//! is the only place a lock is held across slow hardware work.

use crate::bo::Bo;
use crate::debug::*;
use crate::error::Result;
use crate::fence::FenceContext;
use crate::hw::{Hardware, HwIdent};
use crate::mmu::{Mmu, PAGE_SIZE};
use crate::params::Params;
use crate::perfmon::{Perfmon, PerfmonState};
use crate::queue::{Entity, Queue, QueueState, SlotTable, QUEUE_COUNT};
use crate::stats::{PidStats, QueueStats, Stats};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Device;

/// A generator of unique IDs.
pub(crate) struct ID(AtomicU64);

impl ID {
    fn new(val: u64) -> ID {
        ID(AtomicU64::new(val))
    }

    /// Returns the next unique ID.
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// ID sequences for the objects of one device.
pub(crate) struct SequenceIDs {
    pub(crate) job: ID,
    pub(crate) file: ID,
}

/// One V3D GPU.
pub struct V3dDevice {
    name: String,
    ident: HwIdent,
    params: Params,
    pub(crate) hw: Arc<dyn Hardware>,
    pub(crate) mmu: Arc<Mmu>,
    pub(crate) slots: Mutex<SlotTable>,
    pub(crate) entities: [Entity; QUEUE_COUNT],
    pub(crate) fences: [Arc<FenceContext>; QUEUE_COUNT],
    pub(crate) cache_clean: Mutex<()>,
    pub(crate) perfmon: PerfmonState,
    pub(crate) stats: Stats,
    pub(crate) crashed: AtomicBool,
    pub(crate) resets: AtomicU64,
    ids: SequenceIDs,
}

#[derive(Serialize)]
struct QueueSnapshot {
    queue: Queue,
    #[serde(flatten)]
    stats: QueueStats,
}

impl V3dDevice {
    /// Probe the hardware behind `hw` and bring it up.
    pub fn new(hw: Arc<dyn Hardware>, params: Params) -> Result<Arc<V3dDevice>> {
        let ident = hw.ident();
        let name = "v3d".to_string();
        let va_width = params.va_width.unwrap_or(ident.va_width);

        hw.irq_disable();
        hw.irq_reset();
        let mmu = Mmu::new(hw.clone(), va_width)?;

        let dev = Arc::new(V3dDevice {
            name,
            ident,
            stats: Stats::new(params.stats_window_ns()),
            params,
            hw,
            mmu,
            slots: Mutex::new(SlotTable::new()),
            entities: Queue::ALL.map(Entity::new),
            fences: Queue::ALL.map(FenceContext::new),
            cache_clean: Mutex::new(()),
            perfmon: PerfmonState::new(),
            crashed: AtomicBool::new(false),
            resets: AtomicU64::new(0),
            ids: SequenceIDs {
                job: ID::new(1),
                file: ID::new(1),
            },
        });

        dev.hw.irq_enable();
        dev_info!(
            dev,
            "V3D {:?}, {} core(s), {}-bit VA, csd: {}",
            ident.gen,
            ident.cores,
            va_width,
            ident.has_csd()
        );
        Ok(dev)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ident(&self) -> HwIdent {
        self.ident
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn mmu(&self) -> &Arc<Mmu> {
        &self.mmu
    }

    pub(crate) fn ids(&self) -> &SequenceIDs {
        &self.ids
    }

    /// A crashed device fails every job and accepts no new ones.
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Relaxed)
    }

    /// Number of GPU resets performed so far.
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn queue_state(&self, queue: Queue) -> QueueState {
        self.slots.lock().state(queue)
    }

    /// Number of jobs waiting to be issued to `queue`.
    pub fn queued_jobs(&self, queue: Queue) -> usize {
        self.entities[queue.index()].len()
    }

    pub fn fence_context(&self, queue: Queue) -> &Arc<FenceContext> {
        &self.fences[queue.index()]
    }

    /// Allocate `num_pages` of device memory and map it.
    pub fn alloc_bo(&self, num_pages: usize) -> Result<Arc<Bo>> {
        let paddr = self.hw.alloc_coherent(num_pages)?;
        mod_dev_dbg!(
            self,
            "Allocated {} bytes at {:#x}",
            num_pages * PAGE_SIZE,
            paddr
        );
        Bo::new_contiguous(&self.mmu, paddr, num_pages)
    }

    /// Create a perfmon for this device's counter set.
    pub fn new_perfmon(&self, counters: &[u8]) -> Result<Arc<Perfmon>> {
        Perfmon::new(counters, self.ident.num_perfcnt)
    }

    /// Start counting with `perfmon` outside of any job.
    ///
    /// The counters belong to whichever job is issued next: issuing a job that does not carry
    /// `perfmon` stops it and adds what was counted so far to its values. Cache clean jobs do not
    /// touch the counters.
    pub fn perfmon_start(&self, perfmon: &Arc<Perfmon>) -> Result {
        self.perfmon.start(&*self.hw, perfmon)
    }

    /// Stop `perfmon` if it is active, capturing the counts if `capture` is set.
    pub fn perfmon_stop(&self, perfmon: &Arc<Perfmon>, capture: bool) {
        self.perfmon.stop(&*self.hw, perfmon, capture)
    }

    pub fn active_perfmon(&self) -> Option<Arc<Perfmon>> {
        self.perfmon.active()
    }

    /// Per-process usage of `queue`. Observing keeps per-process collection on for another stats
    /// window.
    pub fn pid_stats(&self, queue: Queue) -> Vec<PidStats> {
        self.stats.pid_stats(queue, self.hw.timestamp())
    }

    /// Global usage of `queue`, including the job currently running on it.
    pub fn queue_usage(&self, queue: Queue) -> QueueStats {
        self.stats.usage(queue, self.hw.timestamp())
    }

    /// Global usage of every queue, as JSON.
    pub fn stats_json(&self) -> Result<String> {
        let now = self.hw.timestamp();
        let snapshot: Vec<QueueSnapshot> = Queue::ALL
            .iter()
            .map(|&queue| QueueSnapshot {
                queue,
                stats: self.stats.usage(queue, now),
            })
            .collect();
        Ok(serde_json::to_string(&snapshot)?)
    }
}

impl Drop for V3dDevice {
    fn drop(&mut self) {
        mod_dev_dbg!(self, "Removing device");
        self.hw.irq_disable();
    }
}
