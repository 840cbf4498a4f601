// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Hardware access
//!
//! Everything the core needs from the GPU goes through the `Hardware` trait: kicking queues,
//! reading progress and performance counters, the MMU root, cache maintenance, interrupt enables
//! and the reset sequence. Register offsets and bit layouts live behind the implementation.

use crate::error::Result;
use crate::queue::Queue;

/// V3D hardware generation (tech version and revision).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Gen {
    V33 = 33,
    V41 = 41,
    V42 = 42,
    V71 = 71,
}

/// Identification data read from the hardware at probe time.
#[derive(Copy, Clone, Debug)]
pub struct HwIdent {
    pub gen: Gen,
    /// Number of V3D cores.
    pub cores: u32,
    /// Virtual address bits from V3D to the MMU.
    pub va_width: u32,
    /// Number of selectable performance counter events.
    pub num_perfcnt: u32,
}

impl HwIdent {
    /// Compute shader dispatch was added in 4.1.
    pub fn has_csd(&self) -> bool {
        self.gen >= Gen::V41
    }
}

/// MMU fault details latched by the hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    /// The faulting device address.
    pub address: u64,
    /// The queue whose client faulted, if the hardware could tell.
    pub queue: Option<Queue>,
    pub write: bool,
}

/// Progress registers sampled when a job hits its watchdog threshold.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Control list current address.
    pub ctca: u32,
    /// Control list return address.
    pub ctra: u32,
    /// Number of compute batches dispatched so far.
    pub batches: u32,
}

/// Texture format unit register arguments.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TfuArgs {
    pub icfg: u32,
    pub iia: u32,
    pub iis: u32,
    pub ica: u32,
    pub iua: u32,
    pub ioa: u32,
    pub ios: u32,
    pub coef: [u32; 4],
}

/// Hardware descriptor written when a job is kicked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Bin {
        start: u32,
        end: u32,
        qma: u32,
        qms: u32,
        qts: u32,
    },
    Render {
        start: u32,
        end: u32,
    },
    Tfu(TfuArgs),
    Csd {
        cfg: [u32; 7],
        coef: [u32; 4],
    },
}

/// Low-level access to one V3D instance.
///
/// Implementations must be callable from any thread. None of these calls may block for longer
/// than a register round-trip, except `isolate`, which may wait for outstanding bus traffic.
pub trait Hardware: Send + Sync {
    /// Read the identification registers.
    fn ident(&self) -> HwIdent;
    /// Current GPU timestamp, in nanoseconds.
    fn timestamp(&self) -> u64;
    /// Allocate physically contiguous, device-visible memory. Returns its bus address.
    fn alloc_coherent(&self, pages: usize) -> Result<u64>;

    /// Program a job descriptor and start the queue.
    fn kick(&self, queue: Queue, desc: &Descriptor) -> Result;
    /// Sample the progress registers of a queue.
    fn progress(&self, queue: Queue) -> Progress;
    /// Hand overflow memory to the binner after it ran out.
    fn bin_overflow(&self, address: u32, size: u32);

    /// Invalidate the GPU caches before a job that may read data written by the CPU or by a job
    /// on another queue.
    fn invalidate_caches(&self);
    /// Write back the GPU caches.
    fn clean_caches(&self) -> Result;

    /// Point the MMU at the page table and set the redirect target for illegal accesses.
    fn mmu_set_page_table(&self, pt_base: u64, scratch: u64) -> Result;
    /// Flush MMU TLBs after page table entries changed.
    fn mmu_flush(&self) -> Result;

    /// Reset the performance counters to zero and start counting the given events.
    fn perfmon_start(&self, counters: &[u8]);
    /// Read the current value of every running counter.
    fn perfmon_read(&self, values: &mut [u64]);
    /// Stop all counters.
    fn perfmon_stop(&self);

    fn irq_enable(&self);
    fn irq_disable(&self);
    /// Clear every latched interrupt.
    fn irq_reset(&self);

    /// Stop the GPU from issuing new bus transactions ahead of a reset.
    fn isolate(&self) -> Result;
    /// Begin a full GPU reset.
    fn reset(&self);
    /// Whether the reset started by `reset` has finished.
    fn reset_done(&self) -> bool;
}
