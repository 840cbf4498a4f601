// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Texture format unit jobs

use super::common;
use crate::debug::*;
use crate::error::Result;
use crate::fence::JobFence;
use crate::file::File;
use crate::hw::{Descriptor, TfuArgs};
use crate::job::{Job, JobKind, JobRef};

const DEBUG_CLASS: DebugFlags = DebugFlags::Queue;

/// A texture conversion.
pub struct TfuJob {
    args: TfuArgs,
}

impl TfuJob {
    pub fn new(args: TfuArgs) -> TfuJob {
        TfuJob { args }
    }

    pub(crate) fn descriptor(&self) -> Descriptor {
        Descriptor::Tfu(self.args)
    }
}

/// Arguments of a TFU submission.
#[derive(Clone, Debug, Default)]
pub struct SubmitTfu {
    pub args: TfuArgs,
    pub bo_handles: Vec<u32>,
    pub in_sync: Vec<JobFence>,
}

impl File {
    pub fn submit_tfu(&self, args: &SubmitTfu) -> Result<JobFence> {
        let dev = self.dev();
        mod_dev_dbg!(
            dev,
            "[File {}]: submit_tfu {:#x} -> {:#x}",
            self.id(),
            args.args.iia,
            args.args.ioa
        );

        let bos = common::lookup_bos(self, &args.bo_handles)?;
        let mut job = Job::new(dev, JobKind::Tfu(TfuJob::new(args.args)), bos, self.pid());
        for fence in args.in_sync.iter() {
            job = job.depends_on(fence.clone());
        }

        let job = JobRef::new(job);
        let fence = job.fence();
        dev.submit(job)?;
        Ok(fence)
    }
}
