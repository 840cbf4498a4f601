// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Compute shader dispatch jobs
//!
//! Every compute submission is followed by a cache clean job, so results are visible to the CPU
//! once the submission's fence signals.

use super::common;
use crate::debug::*;
use crate::error::{Error, Result};
use crate::fence::JobFence;
use crate::file::File;
use crate::hw::{Descriptor, Progress};
use crate::job::{Job, JobKind, JobRef};
use parking_lot::Mutex;

const DEBUG_CLASS: DebugFlags = DebugFlags::Queue;

/// A compute dispatch.
pub struct CsdJob {
    cfg: [u32; 7],
    coef: [u32; 4],
    pub(crate) timedout: Mutex<Progress>,
}

impl CsdJob {
    pub fn new(cfg: [u32; 7], coef: [u32; 4]) -> CsdJob {
        CsdJob {
            cfg,
            coef,
            timedout: Mutex::new(Progress::default()),
        }
    }

    pub(crate) fn descriptor(&self) -> Descriptor {
        Descriptor::Csd {
            cfg: self.cfg,
            coef: self.coef,
        }
    }
}

/// Arguments of a compute submission.
#[derive(Clone, Debug, Default)]
pub struct SubmitCsd {
    pub cfg: [u32; 7],
    pub coef: [u32; 4],
    pub bo_handles: Vec<u32>,
    /// Perfmon id, or 0 for none.
    pub perfmon_id: u32,
    pub in_sync: Vec<JobFence>,
}

impl File {
    /// Submit a compute dispatch. Returns the fence of the trailing cache clean job.
    pub fn submit_csd(&self, args: &SubmitCsd) -> Result<JobFence> {
        let dev = self.dev();
        mod_dev_dbg!(dev, "[File {}]: submit_csd cfg {:x?}", self.id(), args.cfg);

        if !dev.ident().has_csd() {
            cls_pr_debug!(Errors, "submit_csd: no compute support on {:?}", dev.ident().gen);
            return Err(Error::InvalidSubmission("compute not supported"));
        }

        let bos = common::lookup_bos(self, &args.bo_handles)?;
        let perfmon = common::lookup_perfmon(self, args.perfmon_id)?;

        let mut csd = Job::new(
            dev,
            JobKind::Csd(CsdJob::new(args.cfg, args.coef)),
            bos.clone(),
            self.pid(),
        );
        for fence in args.in_sync.iter() {
            csd = csd.depends_on(fence.clone());
        }
        if let Some(perfmon) = perfmon {
            csd = csd.with_perfmon(perfmon);
        }
        let csd = JobRef::new(csd);

        let clean = JobRef::new(
            Job::new(dev, JobKind::CacheClean, bos, self.pid()).depends_on(csd.fence()),
        );
        let fence = clean.fence();

        dev.submit(csd)?;
        dev.submit(clean)?;
        Ok(fence)
    }
}
