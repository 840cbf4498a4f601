// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Hardware queues and their slots
//!
//! V3D has one execution unit per queue type. Each can run a single job at a time, so the driver
//! keeps one slot per queue recording the job currently on the hardware. All slots live in one
//! `SlotTable`, which sits behind the device's submission lock: holding the table is what allows a
//! caller to emit fences, change slot state or start a reset.
//!
//! Jobs that are not on the hardware yet wait in a per-queue `Entity`, a FIFO the coordinator
//! drains head-first whenever a slot frees up.

use crate::debug::*;
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::hw::FaultInfo;
use crate::job::JobRef;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub(crate) mod common;
pub mod compute;
pub mod render;
pub mod tfu;

const DEBUG_CLASS: DebugFlags = DebugFlags::Queue;

/// Number of hardware queues.
pub const QUEUE_COUNT: usize = 5;

/// A hardware execution queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum Queue {
    /// Binner (geometry) control lists.
    Bin,
    /// Render (raster) control lists.
    Render,
    /// Texture format unit.
    Tfu,
    /// Compute shader dispatch.
    Csd,
    /// Cache write-back, run by the CPU after compute jobs.
    CacheClean,
}

impl Queue {
    pub const ALL: [Queue; QUEUE_COUNT] = [
        Queue::Bin,
        Queue::Render,
        Queue::Tfu,
        Queue::Csd,
        Queue::CacheClean,
    ];

    pub const fn index(self) -> usize {
        match self {
            Queue::Bin => 0,
            Queue::Render => 1,
            Queue::Tfu => 2,
            Queue::Csd => 3,
            Queue::CacheClean => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Queue::Bin => "v3d_bin",
            Queue::Render => "v3d_render",
            Queue::Tfu => "v3d_tfu",
            Queue::Csd => "v3d_csd",
            Queue::CacheClean => "v3d_cache_clean",
        }
    }
}

/// Slot state of one queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Active,
    /// The job in the slot timed out and the device is being reset.
    Resetting,
}

/// The job occupying a slot.
pub(crate) struct ActiveJob {
    pub(crate) job: JobRef,
    pub(crate) fence: Fence,
    /// GPU timestamp at which the watchdog started timing this job.
    pub(crate) issued_at: u64,
    /// MMU fault raised while the job was running, if any.
    pub(crate) fault: Option<FaultInfo>,
}

struct QueueSlot {
    state: QueueState,
    active: Option<ActiveJob>,
}

/// All queue slots of a device.
pub(crate) struct SlotTable {
    slots: [QueueSlot; QUEUE_COUNT],
}

impl SlotTable {
    pub(crate) fn new() -> SlotTable {
        SlotTable {
            slots: core::array::from_fn(|_| QueueSlot {
                state: QueueState::Idle,
                active: None,
            }),
        }
    }

    pub(crate) fn state(&self, queue: Queue) -> QueueState {
        self.slots[queue.index()].state
    }

    pub(crate) fn active(&self, queue: Queue) -> Option<&ActiveJob> {
        self.slots[queue.index()].active.as_ref()
    }

    pub(crate) fn active_mut(&mut self, queue: Queue) -> Option<&mut ActiveJob> {
        self.slots[queue.index()].active.as_mut()
    }

    /// Whether any queue is in the middle of a reset. Nothing may be issued while this holds.
    pub(crate) fn is_resetting(&self) -> bool {
        self.slots.iter().any(|s| s.state == QueueState::Resetting)
    }

    /// Whether any queue has a job on the hardware.
    pub(crate) fn any_active(&self) -> bool {
        self.slots.iter().any(|s| s.active.is_some())
    }

    /// Whether a job with an attached perfmon is on the hardware.
    pub(crate) fn perfmon_in_flight(&self) -> bool {
        self.slots
            .iter()
            .filter_map(|s| s.active.as_ref())
            .any(|a| a.job.perfmon().is_some())
    }

    /// Idle -> Active.
    pub(crate) fn activate(&mut self, queue: Queue, active: ActiveJob) -> Result {
        if self.is_resetting() {
            pr_err!("{}: issue attempted during a reset", queue.name());
            return Err(Error::InternalConsistency("issue during reset"));
        }
        let slot = &mut self.slots[queue.index()];
        if slot.state != QueueState::Idle || slot.active.is_some() {
            pr_err!(
                "{}: job {} issued into an occupied slot",
                queue.name(),
                active.job.id()
            );
            return Err(Error::InternalConsistency("queue slot occupied"));
        }
        mod_pr_debug!(
            "{}: job {} active (seqno {})",
            queue.name(),
            active.job.id(),
            active.fence.seqno()
        );
        slot.state = QueueState::Active;
        slot.active = Some(active);
        Ok(())
    }

    /// Active -> Idle, handing back the job that was in the slot.
    pub(crate) fn deactivate(&mut self, queue: Queue) -> Option<ActiveJob> {
        let slot = &mut self.slots[queue.index()];
        if slot.state != QueueState::Active {
            return None;
        }
        slot.state = QueueState::Idle;
        slot.active.take()
    }

    /// Active -> Resetting.
    pub(crate) fn begin_reset(&mut self, queue: Queue) -> Result {
        let slot = &mut self.slots[queue.index()];
        if slot.state != QueueState::Active {
            return Err(Error::InternalConsistency("reset of an inactive queue"));
        }
        mod_pr_debug!("{}: resetting", queue.name());
        slot.state = QueueState::Resetting;
        Ok(())
    }

    /// Resetting -> Idle, handing back the stuck job so it can be finalized.
    pub(crate) fn end_reset(&mut self, queue: Queue) -> Option<ActiveJob> {
        let slot = &mut self.slots[queue.index()];
        if slot.state != QueueState::Resetting {
            return None;
        }
        mod_pr_debug!("{}: reset done", queue.name());
        slot.state = QueueState::Idle;
        slot.active.take()
    }

    /// Empty every slot regardless of state. Used when the device is lost.
    pub(crate) fn take_all(&mut self) -> Vec<(Queue, ActiveJob)> {
        let mut jobs = Vec::new();
        for queue in Queue::ALL {
            let slot = &mut self.slots[queue.index()];
            slot.state = QueueState::Idle;
            if let Some(active) = slot.active.take() {
                jobs.push((queue, active));
            }
        }
        jobs
    }
}

/// FIFO of jobs waiting for a queue.
pub(crate) struct Entity {
    queue: Queue,
    jobs: Mutex<VecDeque<JobRef>>,
}

impl Entity {
    pub(crate) fn new(queue: Queue) -> Entity {
        Entity {
            queue,
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, job: JobRef) {
        mod_pr_debug!("{}: queued job {}", self.queue.name(), job.id());
        self.jobs.lock().push_back(job);
    }

    /// Clone of the job at the head of the queue.
    pub(crate) fn peek(&self) -> Option<JobRef> {
        self.jobs.lock().front().cloned()
    }

    pub(crate) fn pop(&self) -> Option<JobRef> {
        self.jobs.lock().pop_front()
    }

    pub(crate) fn drain(&self) -> Vec<JobRef> {
        self.jobs.lock().drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}
