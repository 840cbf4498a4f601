// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Binner and render jobs
//!
//! A control list submission is split into a bin job, which runs the geometry pass and writes the
//! tile lists, and a render job, which rasterizes them. The render job depends on the bin job.
//!
//! When the binner runs out of tile list memory, the driver hands it overflow objects on the fly.
//! Those are referenced by the render job too, so they hang off a list shared by both and are freed
//! when the render job goes away.

use super::common;
use crate::bo::Bo;
use crate::debug::*;
use crate::error::{Error, Result};
use crate::fence::JobFence;
use crate::file::File;
use crate::hw::{Descriptor, Progress};
use crate::job::{Job, JobKind, JobRef};
use parking_lot::Mutex;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Queue;

/// Overflow memory handed to the binner for one bin/render pair.
#[derive(Default)]
pub(crate) struct OverflowList {
    bos: Mutex<Vec<Arc<Bo>>>,
}

impl OverflowList {
    fn len(&self) -> usize {
        self.bos.lock().len()
    }
}

/// Geometry pass of a control list submission.
pub struct BinJob {
    start: u32,
    end: u32,
    qma: u32,
    qms: u32,
    qts: u32,
    pub(crate) timedout: Mutex<Progress>,
    overflow: Arc<OverflowList>,
}

impl BinJob {
    /// A bin job feeding `render`. `qma`, `qms` and `qts` describe the tile state memory.
    pub fn new(start: u32, end: u32, qma: u32, qms: u32, qts: u32, render: &RenderJob) -> BinJob {
        BinJob {
            start,
            end,
            qma,
            qms,
            qts,
            timedout: Mutex::new(Progress::default()),
            overflow: render.overflow.clone(),
        }
    }

    pub(crate) fn descriptor(&self) -> Descriptor {
        Descriptor::Bin {
            start: self.start,
            end: self.end,
            qma: self.qma,
            qms: self.qms,
            qts: self.qts,
        }
    }

    /// Keep `bo` alive until the render job reading it is gone.
    pub(crate) fn add_overflow(&self, bo: Arc<Bo>) {
        self.overflow.bos.lock().push(bo);
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow.len()
    }
}

/// Raster pass of a control list submission.
pub struct RenderJob {
    start: u32,
    end: u32,
    pub(crate) timedout: Mutex<Progress>,
    overflow: Arc<OverflowList>,
}

impl RenderJob {
    pub fn new(start: u32, end: u32) -> RenderJob {
        RenderJob {
            start,
            end,
            timedout: Mutex::new(Progress::default()),
            overflow: Default::default(),
        }
    }

    pub(crate) fn descriptor(&self) -> Descriptor {
        Descriptor::Render {
            start: self.start,
            end: self.end,
        }
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow.len()
    }

    pub(crate) fn release_overflow(&mut self, id: u64) {
        let bos = core::mem::take(&mut *self.overflow.bos.lock());
        if !bos.is_empty() {
            mod_pr_debug!("Job {}: freeing {} overflow objects", id, bos.len());
        }
    }
}

/// Arguments of a control list submission.
#[derive(Clone, Debug, Default)]
pub struct SubmitCl {
    /// Binner control list. An empty list (`bcl_start == bcl_end`) skips the bin job.
    pub bcl_start: u32,
    pub bcl_end: u32,
    pub rcl_start: u32,
    pub rcl_end: u32,
    /// Tile state memory address, size and tile state data address.
    pub qma: u32,
    pub qms: u32,
    pub qts: u32,
    pub bo_handles: Vec<u32>,
    /// Perfmon id, or 0 for none.
    pub perfmon_id: u32,
    /// Write back GPU caches after rendering.
    pub flush_cache: bool,
    /// Fences to wait for before binning starts.
    pub in_sync: Vec<JobFence>,
}

impl File {
    /// Submit a control list. Returns the fence of the last job of the submission.
    pub fn submit_cl(&self, args: &SubmitCl) -> Result<JobFence> {
        let dev = self.dev();
        mod_dev_dbg!(
            dev,
            "[File {}]: submit_cl bcl {:#x}..{:#x} rcl {:#x}..{:#x}",
            self.id(),
            args.bcl_start,
            args.bcl_end,
            args.rcl_start,
            args.rcl_end
        );

        if args.rcl_start == args.rcl_end {
            cls_pr_debug!(Errors, "submit_cl: empty render control list");
            return Err(Error::InvalidSubmission("empty render control list"));
        }

        let bos = common::lookup_bos(self, &args.bo_handles)?;
        let perfmon = common::lookup_perfmon(self, args.perfmon_id)?;

        let render = RenderJob::new(args.rcl_start, args.rcl_end);
        let mut in_sync = args.in_sync.clone();

        let bin = if args.bcl_start != args.bcl_end {
            let mut job = Job::new(
                dev,
                JobKind::Bin(BinJob::new(
                    args.bcl_start,
                    args.bcl_end,
                    args.qma,
                    args.qms,
                    args.qts,
                    &render,
                )),
                bos.clone(),
                self.pid(),
            );
            for fence in in_sync.drain(..) {
                job = job.depends_on(fence);
            }
            if let Some(perfmon) = perfmon.as_ref() {
                job = job.with_perfmon(perfmon.clone());
            }
            Some(JobRef::new(job))
        } else {
            None
        };

        let mut render = Job::new(dev, JobKind::Render(render), bos.clone(), self.pid());
        for fence in in_sync.drain(..) {
            render = render.depends_on(fence);
        }
        if let Some(bin) = bin.as_ref() {
            render = render.depends_on(bin.fence());
        }
        if let Some(perfmon) = perfmon {
            render = render.with_perfmon(perfmon);
        }
        let render = JobRef::new(render);

        let clean = if args.flush_cache {
            let job = Job::new(dev, JobKind::CacheClean, bos, self.pid())
                .depends_on(render.fence());
            Some(JobRef::new(job))
        } else {
            None
        };

        let mut last = render.fence();
        if let Some(bin) = bin {
            dev.submit(bin)?;
        }
        dev.submit(render)?;
        if let Some(clean) = clean {
            last = clean.fence();
            dev.submit(clean)?;
        }

        Ok(last)
    }
}
