// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Jobs
//!
//! A `Job` is one unit of work for one queue. It is built by the caller, wrapped into a reference
//! counted `JobRef` and handed to `V3dDevice::submit`, which pins its objects and queues it. The
//! coordinator takes the queued reference when it issues the job, keeps it in the queue slot while
//! the job runs, and drops it once the job has been finalized.
//!
//! Queue-specific data lives in `JobKind`. When the last reference goes away, `Drop` dispatches on
//! the kind to release whatever the variant owns.

use crate::bo::{Bo, BoPin};
use crate::debug::*;
use crate::device::V3dDevice;
use crate::error::{JobError, Result};
use crate::fence::{Fence, JobFence};
use crate::hw::{Descriptor, Progress};
use crate::perfmon::Perfmon;
use crate::queue::compute::CsdJob;
use crate::queue::render::{BinJob, RenderJob};
use crate::queue::tfu::TfuJob;
use crate::queue::Queue;
use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

const DEBUG_CLASS: DebugFlags = DebugFlags::Job;

/// Queue-specific part of a job.
pub enum JobKind {
    Bin(BinJob),
    Render(RenderJob),
    Tfu(TfuJob),
    Csd(CsdJob),
    CacheClean,
}

impl JobKind {
    pub fn queue(&self) -> Queue {
        match self {
            JobKind::Bin(_) => Queue::Bin,
            JobKind::Render(_) => Queue::Render,
            JobKind::Tfu(_) => Queue::Tfu,
            JobKind::Csd(_) => Queue::Csd,
            JobKind::CacheClean => Queue::CacheClean,
        }
    }

    /// What gets written to the hardware to start the job. Cache clean jobs run on the CPU.
    pub(crate) fn descriptor(&self) -> Option<Descriptor> {
        match self {
            JobKind::Bin(j) => Some(j.descriptor()),
            JobKind::Render(j) => Some(j.descriptor()),
            JobKind::Tfu(j) => Some(j.descriptor()),
            JobKind::Csd(j) => Some(j.descriptor()),
            JobKind::CacheClean => None,
        }
    }

    /// Progress snapshot taken the last time the job hit the watchdog, for queues that can report
    /// progress.
    pub(crate) fn timeout_snapshot(&self) -> Option<&Mutex<Progress>> {
        match self {
            JobKind::Bin(j) => Some(&j.timedout),
            JobKind::Render(j) => Some(&j.timedout),
            JobKind::Csd(j) => Some(&j.timedout),
            JobKind::Tfu(_) | JobKind::CacheClean => None,
        }
    }
}

/// One submitted unit of work.
pub struct Job {
    id: u64,
    pid: u32,
    kind: JobKind,
    bos: Vec<Arc<Bo>>,
    pins: Mutex<Vec<BoPin>>,
    done: JobFence,
    perfmon: Option<Arc<Perfmon>>,
    deps: Vec<JobFence>,
    irq_fence: OnceLock<Fence>,
    submitted: AtomicBool,
}

impl Job {
    /// Create a job for process `pid` referencing `bos`.
    pub fn new(dev: &V3dDevice, kind: JobKind, bos: Vec<Arc<Bo>>, pid: u32) -> Job {
        let id = dev.ids().job.next();
        mod_dev_dbg!(dev, "Job {}: new {} job", id, kind.queue().name());
        Job {
            id,
            pid,
            kind,
            bos,
            pins: Mutex::new(Vec::new()),
            done: JobFence::new(id),
            perfmon: None,
            deps: Vec::new(),
            irq_fence: OnceLock::new(),
            submitted: AtomicBool::new(false),
        }
    }

    /// Count performance events while this job runs.
    pub fn with_perfmon(mut self, perfmon: Arc<Perfmon>) -> Job {
        self.perfmon = Some(perfmon);
        self
    }

    /// Do not issue this job before `fence` signals. If it signals with an error, this job is
    /// canceled.
    pub fn depends_on(mut self, fence: JobFence) -> Job {
        self.deps.push(fence);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn queue(&self) -> Queue {
        self.kind.queue()
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn bos(&self) -> &[Arc<Bo>] {
        &self.bos
    }

    pub fn perfmon(&self) -> Option<&Arc<Perfmon>> {
        self.perfmon.as_ref()
    }

    /// The caller-visible completion fence.
    pub fn fence(&self) -> JobFence {
        self.done.clone()
    }

    /// The hardware fence, once the job has been issued.
    pub fn irq_fence(&self) -> Option<&Fence> {
        self.irq_fence.get()
    }

    pub(crate) fn set_irq_fence(&self, fence: Fence) -> bool {
        self.irq_fence.set(fence).is_ok()
    }

    pub(crate) fn deps(&self) -> &[JobFence] {
        &self.deps
    }

    /// Pin every object of the job. Fails if any of them is not mapped, leaving none pinned.
    pub(crate) fn pin(&self) -> Result {
        let pins = self.bos.iter().map(BoPin::new).collect::<Result<Vec<_>>>()?;
        *self.pins.lock() = pins;
        Ok(())
    }

    /// Claim the job for submission. Only the first call returns true.
    pub(crate) fn mark_submitted(&self) -> bool {
        self.submitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the pins and signal the completion fence. Only the first call has any effect.
    pub(crate) fn finish(&self, result: core::result::Result<(), JobError>) {
        let pins = core::mem::take(&mut *self.pins.lock());
        core::mem::drop(pins);
        if !self.done.signal(result) {
            mod_pr_debug!("Job {}: already finished", self.id);
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        mod_pr_debug!("Job {}: dropping", self.id);
        if !self.done.is_signaled() {
            // Never ran, e.g. still queued when the device went away.
            self.finish(Err(JobError::Canceled));
        }
        match &mut self.kind {
            JobKind::Render(render) => render.release_overflow(self.id),
            JobKind::Bin(bin) => mod_pr_debug!(
                "Job {}: {} overflow objects stay with the render job",
                self.id,
                bin.overflow_count()
            ),
            JobKind::Tfu(_) | JobKind::Csd(_) | JobKind::CacheClean => {}
        }
    }
}

/// A counted reference to a job.
#[derive(Clone)]
pub struct JobRef(Arc<Job>);

impl JobRef {
    pub fn new(job: Job) -> JobRef {
        JobRef(Arc::new(job))
    }

    /// Drop this reference. Returns true if it was the last one and the job has been freed.
    pub fn release(self) -> bool {
        Arc::into_inner(self.0).is_some()
    }

    /// Number of live references.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl core::ops::Deref for JobRef {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.0
    }
}
