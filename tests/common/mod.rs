// SPDX-License-Identifier: GPL-2.0-only OR MIT

#![allow(dead_code)]

use std::sync::Arc;
use v3d::bo::Bo;
use v3d::hw::TfuArgs;
use v3d::queue::tfu::TfuJob;
use v3d::sim::SimGpu;
use v3d::{IrqEvent, Job, JobKind, JobRef, Params, Queue, V3dDevice};

pub const MS: u64 = 1_000_000;

pub struct Harness {
    pub hw: Arc<SimGpu>,
    pub dev: Arc<V3dDevice>,
}

impl Harness {
    pub fn new() -> Harness {
        Harness::with_params(Params::default())
    }

    pub fn with_json(json: &str) -> Harness {
        Harness::with_params(Params::from_json(json).unwrap())
    }

    pub fn with_params(params: Params) -> Harness {
        Harness::with_hw(SimGpu::new(), params)
    }

    pub fn with_hw(hw: SimGpu, params: Params) -> Harness {
        let hw = Arc::new(hw);
        let dev = V3dDevice::new(hw.clone(), params).unwrap();
        Harness { hw, dev }
    }

    pub fn bo(&self) -> Arc<Bo> {
        self.dev.alloc_bo(1).unwrap()
    }

    pub fn tfu_job(&self, pid: u32) -> Job {
        Job::new(
            &self.dev,
            JobKind::Tfu(TfuJob::new(TfuArgs::default())),
            vec![self.bo()],
            pid,
        )
    }

    pub fn submit_tfu(&self, pid: u32) -> JobRef {
        let job = JobRef::new(self.tfu_job(pid));
        self.dev.submit(job.clone()).unwrap();
        job
    }

    /// Deliver the completion interrupt of the job active on `queue`, ending now.
    pub fn complete(&self, queue: Queue) -> v3d::Result {
        let seqno = self.dev.fence_context(queue).last_emitted();
        let start_ns = self.dev.queue_usage(queue).last_exec_start;
        self.dev.handle_irq(IrqEvent::JobDone {
            queue,
            seqno,
            start_ns,
            end_ns: self.hw.now(),
        })
    }
}
