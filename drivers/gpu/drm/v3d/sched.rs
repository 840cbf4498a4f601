// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Job submission, completion and GPU recovery
//!
//! Submitted jobs wait in their queue's entity until the queue is idle and the job is runnable.
//! Issuing a job moves it into its queue slot and kicks the hardware; the completion interrupt
//! moves it out again and finalizes it. Every one of these transitions happens with the
//! submission lock (the `SlotTable`) held.
//!
//! A watchdog pass checks how long each active job has been running. A job over its queue's
//! threshold that made no progress since the last check gets the whole GPU reset. The stuck job is
//! failed, and jobs that were running on other queues are started over once the reset is done.

use crate::debug::*;
use crate::device::V3dDevice;
use crate::error::{Error, JobError, Result};
use crate::hw::Progress;
use crate::job::JobRef;
use crate::queue::{ActiveJob, Queue, QueueState, SlotTable};
use crate::util::wait_for;
use core::sync::atomic::Ordering;
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

const DEBUG_CLASS: DebugFlags = DebugFlags::Sched;

enum Runnable {
    Ready,
    Blocked,
    /// A dependency failed.
    Canceled,
}

/// Whether a job that hit the watchdog moved on since the previous check.
fn made_progress(queue: Queue, last: &Progress, now: &Progress) -> bool {
    match queue {
        Queue::Bin | Queue::Render => (last.ctca, last.ctra) != (now.ctca, now.ctra),
        Queue::Csd => last.batches != now.batches,
        Queue::Tfu | Queue::CacheClean => false,
    }
}

impl V3dDevice {
    /// Pin the objects of `job` and queue it for execution.
    ///
    /// The caller keeps its own reference; the job's fence reports the outcome.
    pub fn submit(&self, job: JobRef) -> Result {
        if self.is_crashed() {
            dev_err!(self, "Job {}: GPU is crashed, cannot submit", job.id());
            return Err(Error::NoDevice);
        }

        let queue = job.queue();
        let max = self.params().max_bos_per_job;
        if job.bos().is_empty() || job.bos().len() > max {
            cls_pr_debug!(
                Errors,
                "submit: object count {} out of valid range [1, {}]",
                job.bos().len(),
                max
            );
            return Err(Error::InvalidSubmission("object count"));
        }
        if job.perfmon().is_some() && !matches!(queue, Queue::Bin | Queue::Render | Queue::Csd) {
            cls_pr_debug!(Errors, "submit: perfmon not allowed on {}", queue.name());
            return Err(Error::InvalidSubmission("perfmon on this queue"));
        }
        if queue == Queue::Csd && !self.ident().has_csd() {
            cls_pr_debug!(Errors, "submit: no compute queue on {:?}", self.ident().gen);
            return Err(Error::InvalidSubmission("no compute queue"));
        }
        if job.fence().is_signaled() || !job.mark_submitted() {
            cls_pr_debug!(Errors, "submit: job {} was already submitted", job.id());
            return Err(Error::InvalidSubmission("job already submitted"));
        }

        // Pins are taken under each object's mapping lock: an unmap either finished first and
        // the submission fails here, or it sees the pin and fails with `Busy`.
        if let Err(e) = job.pin() {
            cls_pr_debug!(Errors, "submit: job {} references an unmapped object", job.id());
            return Err(match e {
                Error::NoEntry => Error::InvalidSubmission("object not mapped"),
                e => e,
            });
        }
        self.entities[queue.index()].push(job);
        self.pump();
        Ok(())
    }

    /// Issue every runnable job to its idle queue.
    pub(crate) fn pump(&self) {
        let mut slots = self.slots.lock();
        self.pump_locked(&mut slots);
    }

    fn runnable(&self, slots: &SlotTable, job: &JobRef) -> Runnable {
        for dep in job.deps() {
            match dep.status() {
                None => return Runnable::Blocked,
                Some(Err(_)) => return Runnable::Canceled,
                Some(Ok(())) => {}
            }
        }
        // The counters are shared by all queues, so a job with a perfmon must have the GPU to
        // itself.
        if slots.perfmon_in_flight() || (job.perfmon().is_some() && slots.any_active()) {
            return Runnable::Blocked;
        }
        Runnable::Ready
    }

    pub(crate) fn pump_locked(&self, slots: &mut SlotTable) {
        if self.is_crashed() {
            self.fail_queued(JobError::Lost);
            return;
        }
        if slots.is_resetting() {
            return;
        }

        loop {
            let mut progress = false;

            for queue in Queue::ALL {
                if slots.state(queue) != QueueState::Idle {
                    continue;
                }
                let entity = &self.entities[queue.index()];
                let runnable = match entity.peek() {
                    Some(head) => self.runnable(slots, &head),
                    None => continue,
                };
                if let Runnable::Blocked = runnable {
                    continue;
                }
                let Some(job) = entity.pop() else {
                    continue;
                };
                progress = true;

                if let Runnable::Canceled = runnable {
                    mod_dev_dbg!(self, "Job {}: dependency failed, canceling", job.id());
                    job.finish(Err(JobError::Canceled));
                    continue;
                }

                if let Err(e) = self.issue_to_hardware(slots, job.clone()) {
                    dev_err!(self, "Job {}: failed to issue: {:?}", job.id(), e);
                    if self.is_crashed() {
                        job.finish(Err(JobError::Lost));
                        self.crash(slots, "issue failed");
                        return;
                    }
                    job.finish(Err(JobError::IssueFailed));
                }
            }

            if !progress {
                break;
            }
        }
    }

    /// Hand `job` to the hardware and make it the active job of its queue.
    pub(crate) fn issue_to_hardware(&self, slots: &mut SlotTable, job: JobRef) -> Result {
        let queue = job.queue();
        if slots.state(queue) != QueueState::Idle || slots.is_resetting() {
            self.crashed.store(true, Ordering::Relaxed);
            dev_err!(self, "Job {}: {} is not idle", job.id(), queue.name());
            return Err(Error::InternalConsistency("queue slot occupied"));
        }

        let fence = self.fences[queue.index()].create(slots);
        if !job.set_irq_fence(fence.clone()) {
            self.crashed.store(true, Ordering::Relaxed);
            dev_err!(self, "Job {}: issued twice", job.id());
            return Err(Error::InternalConsistency("job issued twice"));
        }

        let now = self.hw.timestamp();
        mod_dev_dbg!(
            self,
            "Job {}: issuing to {} (seqno {}, pid {})",
            job.id(),
            queue.name(),
            fence.seqno(),
            job.pid()
        );
        let seqno = fence.seqno();
        let active = ActiveJob {
            job: job.clone(),
            fence,
            issued_at: now,
            fault: None,
        };

        let Some(desc) = job.kind().descriptor() else {
            // Cache clean jobs run synchronously on the CPU.
            let guard = self.cache_clean.lock();
            let ret = self.hw.clean_caches();
            core::mem::drop(guard);
            if let Err(e) = ret {
                self.fences[queue.index()].force_complete(seqno);
                return Err(e);
            }

            self.stats.job_started(queue, job.pid(), now);
            slots.activate(queue, active)?;
            return self.complete_locked(slots, queue, seqno, now, now);
        };

        if matches!(queue, Queue::Render | Queue::Csd) {
            let _guard = self.cache_clean.lock();
            self.hw.invalidate_caches();
        }
        self.perfmon.switch_to(&*self.hw, job.perfmon());
        if let Err(e) = self.hw.kick(queue, &desc) {
            // The job never started: nothing was counted and its seqno will never complete.
            if let Some(perfmon) = job.perfmon() {
                self.perfmon.stop(&*self.hw, perfmon, false);
            }
            self.fences[queue.index()].force_complete(seqno);
            return Err(e);
        }

        self.stats.job_started(queue, job.pid(), now);
        slots.activate(queue, active).inspect_err(|_| {
            self.crashed.store(true, Ordering::Relaxed);
        })
    }

    /// Completion of `seqno` on `queue`, as reported by the hardware.
    pub(crate) fn on_hardware_complete(
        &self,
        queue: Queue,
        seqno: u64,
        start: u64,
        end: u64,
    ) -> Result {
        let mut slots = self.slots.lock();
        let ret = self.complete_locked(&mut slots, queue, seqno, start, end);
        if ret.is_err() {
            self.crash(&mut slots, "bad completion");
        }
        self.pump_locked(&mut slots);
        ret
    }

    fn complete_locked(
        &self,
        slots: &mut SlotTable,
        queue: Queue,
        seqno: u64,
        start: u64,
        end: u64,
    ) -> Result {
        let expected = slots.active(queue).map(|a| a.fence.seqno());
        if expected != Some(seqno) {
            self.crashed.store(true, Ordering::Relaxed);
            dev_err!(
                self,
                "{}: completion of seqno {} but active is {:?}",
                queue.name(),
                seqno,
                expected
            );
            return Err(Error::InternalConsistency("completion does not match active job"));
        }
        if let Err(e) = self.fences[queue.index()].advance(seqno) {
            self.crashed.store(true, Ordering::Relaxed);
            return Err(e);
        }
        let active = slots
            .deactivate(queue)
            .ok_or(Error::InternalConsistency("active job vanished"))?;

        let result = match active.fault {
            Some(fault) => Err(JobError::Fault(fault)),
            None => Ok(()),
        };
        self.retire(queue, active, start, end, result);
        Ok(())
    }

    /// Finalize a job that left its slot.
    fn retire(
        &self,
        queue: Queue,
        active: ActiveJob,
        start: u64,
        end: u64,
        result: core::result::Result<(), JobError>,
    ) {
        let job = active.job;
        mod_dev_dbg!(
            self,
            "Job {}: retired from {} ({:?})",
            job.id(),
            queue.name(),
            result
        );

        if let Some(perfmon) = job.perfmon() {
            self.perfmon.stop(&*self.hw, perfmon, true);
        }
        self.stats
            .job_done(queue, job.pid(), start, end, self.hw.timestamp());
        job.finish(result);
        // Drops the slot's reference.
        core::mem::drop(job);
    }

    /// Fail every job waiting in an entity.
    fn fail_queued(&self, err: JobError) {
        for entity in self.entities.iter() {
            for job in entity.drain() {
                mod_dev_dbg!(self, "Job {}: failing queued job ({:?})", job.id(), err);
                job.finish(Err(err));
            }
        }
    }

    /// Give up on the GPU: mark it crashed and fail every active and queued job.
    fn crash(&self, slots: &mut SlotTable, reason: &str) {
        if !self.crashed.swap(true, Ordering::Relaxed) {
            dev_err!(self, "GPU crashed: {}", reason);
        }
        for (queue, active) in slots.take_all() {
            self.fences[queue.index()].force_complete(active.fence.seqno());
            if let Some(perfmon) = active.job.perfmon() {
                self.perfmon.stop(&*self.hw, perfmon, false);
            }
            active.job.finish(Err(JobError::Lost));
        }
        self.fail_queued(JobError::Lost);
    }

    /// Check every active job against its queue's watchdog threshold, resetting the GPU for any
    /// job that is stuck.
    pub fn check_timeouts(&self) -> Result {
        let mut slots = self.slots.lock();
        if self.is_crashed() {
            return Err(Error::NoDevice);
        }
        let now = self.hw.timestamp();

        for queue in Queue::ALL {
            let timeout = self.params().timeout_ns(queue);
            let Some(active) = slots.active_mut(queue) else {
                continue;
            };
            if now.saturating_sub(active.issued_at) < timeout {
                continue;
            }

            if let Some(snapshot) = active.job.kind().timeout_snapshot() {
                let progress = self.hw.progress(queue);
                let mut last = snapshot.lock();
                if made_progress(queue, &last, &progress) {
                    mod_dev_dbg!(
                        self,
                        "Job {}: over the threshold on {} but still progressing",
                        active.job.id(),
                        queue.name()
                    );
                    *last = progress;
                    active.issued_at = now;
                    continue;
                }
            }

            self.reset_locked(&mut slots, queue)?;
        }

        self.pump_locked(&mut slots);
        Ok(())
    }

    /// Reset the GPU because the job on `queue` is stuck.
    fn reset_locked(&self, slots: &mut SlotTable, queue: Queue) -> Result {
        dev_err!(self, "{}: job timed out, resetting GPU", queue.name());
        slots.begin_reset(queue)?;
        self.resets.fetch_add(1, Ordering::Relaxed);

        // The submission lock stays held across the whole reset sequence. This is the one place it
        // is held across slow hardware work, and it is bounded by the reset timeout.
        if let Err(e) = self.reset_hw() {
            dev_err!(self, "GPU reset failed: {:?}", e);
            self.crash(slots, "reset failed");
            return Err(e);
        }

        let stuck = slots
            .end_reset(queue)
            .ok_or(Error::InternalConsistency("reset queue has no job"))?;
        self.fences[queue.index()].force_complete(stuck.fence.seqno());

        let now = self.hw.timestamp();
        let start = stuck.issued_at;
        let err = stuck.fault.map_or(JobError::TimedOut, JobError::Fault);
        self.retire(queue, stuck, start, now, Err(err));

        // Work on the other queues was lost with the reset. Start it over.
        for other in Queue::ALL {
            if other == queue {
                continue;
            }
            let Some(active) = slots.active_mut(other) else {
                continue;
            };
            if let Some(desc) = active.job.kind().descriptor() {
                mod_dev_dbg!(self, "Job {}: restarting on {}", active.job.id(), other.name());
                if matches!(other, Queue::Render | Queue::Csd) {
                    let _guard = self.cache_clean.lock();
                    self.hw.invalidate_caches();
                }
                self.hw.kick(other, &desc)?;
                active.issued_at = now;
            }
        }
        Ok(())
    }

    fn reset_hw(&self) -> Result {
        self.hw.irq_disable();
        self.hw.isolate()?;
        self.hw.reset();
        if !wait_for(self.params().reset_timeout(), || self.hw.reset_done()) {
            return Err(Error::TimedOut);
        }
        self.mmu.set_page_table()?;
        self.perfmon.abort(&*self.hw);
        self.hw.irq_reset();
        self.hw.irq_enable();
        Ok(())
    }

    /// Run `check_timeouts` every `period` on a background thread, until the returned handle is
    /// dropped or the device goes away.
    pub fn start_watchdog(self: &Arc<Self>, period: Duration) -> Result<Watchdog> {
        let dev: Weak<V3dDevice> = Arc::downgrade(self);
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = stop.clone();

        let thread = thread::Builder::new()
            .name(format!("{}-watchdog", self.name()))
            .spawn(move || {
                let (lock, cond) = &*thread_stop;
                let mut stopped = lock.lock();
                loop {
                    cond.wait_for(&mut stopped, period);
                    if *stopped {
                        break;
                    }
                    let Some(dev) = dev.upgrade() else {
                        break;
                    };
                    if let Err(Error::NoDevice) = dev.check_timeouts() {
                        break;
                    }
                }
            })?;

        mod_dev_dbg!(self, "Watchdog running every {:?}", period);
        Ok(Watchdog {
            stop,
            thread: Some(thread),
        })
    }
}

/// Handle to a running watchdog thread. Dropping it stops the thread.
pub struct Watchdog {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let (lock, cond) = &*self.stop;
        *lock.lock() = true;
        cond.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                cls_pr_debug!(Sched, "Watchdog thread panicked");
            }
        }
    }
}
