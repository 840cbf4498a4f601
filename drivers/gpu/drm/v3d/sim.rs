// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Software model of a V3D instance
//!
//! `SimGpu` implements `Hardware` without any real device behind it. It keeps a manual clock,
//! records every operation the core performs, and lets the caller script progress registers,
//! performance counter events and reset behavior. Completions are not generated on their own: the
//! caller decides when a job finished and delivers the matching `IrqEvent` to the device.

use crate::error::{Error, Result};
use crate::hw::{Descriptor, Gen, Hardware, HwIdent, Progress};
use crate::queue::{Queue, QUEUE_COUNT};
use parking_lot::{Mutex, MutexGuard};

/// One recorded hardware operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Kick(Queue, Descriptor),
    InvalidateCaches,
    CleanCaches,
    SetPageTable { pt_base: u64, scratch: u64 },
    MmuFlush,
    BinOverflow { address: u32, size: u32 },
    PerfmonStart(Vec<u8>),
    PerfmonStop,
    IrqEnable,
    IrqDisable,
    IrqReset,
    Isolate,
    Reset,
}

struct SimState {
    now: u64,
    next_dma: u64,
    ops: Vec<Op>,
    progress: [Progress; QUEUE_COUNT],
    running: Vec<u8>,
    counts: Vec<u64>,
    reset_works: bool,
    irq_enabled: bool,
}

/// A simulated GPU.
pub struct SimGpu {
    ident: HwIdent,
    state: Mutex<SimState>,
}

/// Base of the simulated DMA pool.
const DMA_BASE: u64 = 0x4000_0000;

impl SimGpu {
    /// A 4.2 part with a 16 MiB address space, which keeps page tables small.
    pub fn new() -> SimGpu {
        SimGpu::with_ident(HwIdent {
            gen: Gen::V42,
            cores: 1,
            va_width: 24,
            num_perfcnt: 87,
        })
    }

    pub fn with_ident(ident: HwIdent) -> SimGpu {
        SimGpu {
            ident,
            state: Mutex::new(SimState {
                now: 1_000_000,
                next_dma: DMA_BASE,
                ops: Vec::new(),
                progress: Default::default(),
                running: Vec::new(),
                counts: Vec::new(),
                reset_works: true,
                irq_enabled: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock()
    }

    /// Move the GPU clock forward.
    pub fn advance(&self, ns: u64) {
        self.lock().now += ns;
    }

    /// Current GPU clock, in nanoseconds.
    pub fn now(&self) -> u64 {
        self.lock().now
    }

    /// Every operation recorded so far.
    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    /// Drain the operation log.
    pub fn take_ops(&self) -> Vec<Op> {
        core::mem::take(&mut self.lock().ops)
    }

    /// Descriptors kicked to a queue, oldest first.
    pub fn kicks(&self, queue: Queue) -> Vec<Descriptor> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Kick(q, desc) if *q == queue => Some(*desc),
                _ => None,
            })
            .collect()
    }

    /// Set what the progress registers of a queue read back.
    pub fn set_progress(&self, queue: Queue, progress: Progress) {
        self.lock().progress[queue.index()] = progress;
    }

    /// Count `n` occurrences of a performance event. Only counted if the event is selected.
    pub fn count_event(&self, event: u8, n: u64) {
        let mut state = self.lock();
        let SimState {
            running, counts, ..
        } = &mut *state;
        for (slot, selected) in running.iter().enumerate() {
            if *selected == event {
                counts[slot] += n;
            }
        }
    }

    /// Make subsequent resets never report completion.
    pub fn break_reset(&self) {
        self.lock().reset_works = false;
    }

    pub fn irq_enabled(&self) -> bool {
        self.lock().irq_enabled
    }

    fn record(&self, op: Op) {
        self.lock().ops.push(op);
    }
}

impl Default for SimGpu {
    fn default() -> Self {
        SimGpu::new()
    }
}

impl Hardware for SimGpu {
    fn ident(&self) -> HwIdent {
        self.ident
    }

    fn timestamp(&self) -> u64 {
        self.lock().now
    }

    fn alloc_coherent(&self, pages: usize) -> Result<u64> {
        let mut state = self.lock();
        let addr = state.next_dma;
        state.next_dma = (pages as u64)
            .checked_mul(4096)
            .and_then(|size| addr.checked_add(size))
            .ok_or(Error::NoSpace)?;
        Ok(addr)
    }

    fn kick(&self, queue: Queue, desc: &Descriptor) -> Result {
        self.record(Op::Kick(queue, *desc));
        Ok(())
    }

    fn progress(&self, queue: Queue) -> Progress {
        self.lock().progress[queue.index()]
    }

    fn bin_overflow(&self, address: u32, size: u32) {
        self.record(Op::BinOverflow { address, size });
    }

    fn invalidate_caches(&self) {
        self.record(Op::InvalidateCaches);
    }

    fn clean_caches(&self) -> Result {
        self.record(Op::CleanCaches);
        Ok(())
    }

    fn mmu_set_page_table(&self, pt_base: u64, scratch: u64) -> Result {
        self.record(Op::SetPageTable { pt_base, scratch });
        Ok(())
    }

    fn mmu_flush(&self) -> Result {
        self.record(Op::MmuFlush);
        Ok(())
    }

    fn perfmon_start(&self, counters: &[u8]) {
        let mut state = self.lock();
        state.running = counters.to_vec();
        state.counts = vec![0; counters.len()];
        state.ops.push(Op::PerfmonStart(counters.to_vec()));
    }

    fn perfmon_read(&self, values: &mut [u64]) {
        let state = self.lock();
        for (value, count) in values.iter_mut().zip(state.counts.iter()) {
            *value = *count;
        }
    }

    fn perfmon_stop(&self) {
        let mut state = self.lock();
        state.running.clear();
        state.ops.push(Op::PerfmonStop);
    }

    fn irq_enable(&self) {
        let mut state = self.lock();
        state.irq_enabled = true;
        state.ops.push(Op::IrqEnable);
    }

    fn irq_disable(&self) {
        let mut state = self.lock();
        state.irq_enabled = false;
        state.ops.push(Op::IrqDisable);
    }

    fn irq_reset(&self) {
        self.record(Op::IrqReset);
    }

    fn isolate(&self) -> Result {
        self.record(Op::Isolate);
        Ok(())
    }

    fn reset(&self) {
        self.record(Op::Reset);
    }

    fn reset_done(&self) -> bool {
        self.lock().reset_works
    }
}
