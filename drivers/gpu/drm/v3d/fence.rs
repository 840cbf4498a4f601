// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Completion fences
//!
//! Each queue has a `FenceContext` holding two counters: the last sequence number handed to the
//! hardware and the last one the hardware reported complete. A `Fence` is a (queue, seqno) pair and
//! is signaled once the completed counter reaches its seqno. Seqnos are only emitted while the
//! submission lock is held, so per-queue seqno order is hardware issue order.
//!
//! A `JobFence` is the caller-visible completion of a job. Unlike a `Fence` it carries an outcome,
//! so jobs that were failed by the driver (timeouts, faults, canceled dependencies) signal it with
//! an error instead of appearing complete.

use crate::debug::*;
use crate::error::{Error, JobError, Result};
use crate::queue::{Queue, SlotTable};
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

const DEBUG_CLASS: DebugFlags = DebugFlags::Fence;

/// Outcome of a bounded wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// Per-queue sequence state.
pub struct FenceContext {
    queue: Queue,
    emit_seqno: AtomicU64,
    completed: Mutex<u64>,
    cond: Condvar,
}

impl FenceContext {
    pub(crate) fn new(queue: Queue) -> Arc<FenceContext> {
        Arc::new(FenceContext {
            queue,
            emit_seqno: AtomicU64::new(0),
            completed: Mutex::new(0),
            cond: Condvar::new(),
        })
    }

    /// Emit the next fence for this queue. Only called with the submission lock held.
    pub(crate) fn create(self: &Arc<Self>, _slots: &mut SlotTable) -> Fence {
        let seqno = self.emit_seqno.fetch_add(1, Ordering::Relaxed) + 1;
        mod_pr_debug!("{}: emit seqno {}", self.queue.name(), seqno);
        Fence {
            ctx: self.clone(),
            seqno,
        }
    }

    /// The last seqno handed to the hardware.
    pub fn last_emitted(&self) -> u64 {
        self.emit_seqno.load(Ordering::Relaxed)
    }

    /// The last seqno the hardware reported complete.
    pub fn last_completed(&self) -> u64 {
        *self.completed.lock()
    }

    /// Record that the hardware completed `seqno`.
    ///
    /// Completions must arrive in strictly increasing order and only for emitted seqnos. Anything
    /// else means the driver's view of the hardware is wrong.
    pub(crate) fn advance(&self, seqno: u64) -> Result {
        let mut completed = self.completed.lock();
        if seqno <= *completed || seqno > self.last_emitted() {
            pr_err!(
                "{}: completion of seqno {} out of order (completed {}, emitted {})",
                self.queue.name(),
                seqno,
                *completed,
                self.last_emitted()
            );
            return Err(Error::InternalConsistency("fence seqno out of order"));
        }
        *completed = seqno;
        self.cond.notify_all();
        Ok(())
    }

    /// Mark `seqno` complete on behalf of hardware that will never report it, after a reset.
    pub(crate) fn force_complete(&self, seqno: u64) {
        let mut completed = self.completed.lock();
        if seqno > *completed {
            mod_pr_debug!("{}: force-completing seqno {}", self.queue.name(), seqno);
            *completed = seqno;
            self.cond.notify_all();
        }
    }
}

/// A hardware completion token.
#[derive(Clone)]
pub struct Fence {
    ctx: Arc<FenceContext>,
    seqno: u64,
}

impl Fence {
    pub fn queue(&self) -> Queue {
        self.ctx.queue
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn is_signaled(&self) -> bool {
        self.ctx.last_completed() >= self.seqno
    }

    /// Block the calling thread until the fence signals or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        let mut completed = self.ctx.completed.lock();
        while *completed < self.seqno {
            if self.ctx.cond.wait_until(&mut completed, deadline).timed_out() {
                break;
            }
        }
        if *completed >= self.seqno {
            WaitStatus::Signaled
        } else {
            WaitStatus::TimedOut
        }
    }
}

impl core::fmt::Debug for Fence {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fence")
            .field("queue", &self.ctx.queue)
            .field("seqno", &self.seqno)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

struct JobFenceInner {
    id: u64,
    status: Mutex<Option<core::result::Result<(), JobError>>>,
    cond: Condvar,
}

/// The caller-visible completion of one job. Cloning shares the same fence.
#[derive(Clone)]
pub struct JobFence(Arc<JobFenceInner>);

impl JobFence {
    pub(crate) fn new(id: u64) -> JobFence {
        JobFence(Arc::new(JobFenceInner {
            id,
            status: Mutex::new(None),
            cond: Condvar::new(),
        }))
    }

    /// Id of the job this fence belongs to.
    pub fn job_id(&self) -> u64 {
        self.0.id
    }

    /// Signal the fence. Returns false if it was already signaled, in which case the first outcome
    /// stands.
    pub(crate) fn signal(&self, result: core::result::Result<(), JobError>) -> bool {
        let mut status = self.0.status.lock();
        if status.is_some() {
            return false;
        }
        mod_pr_debug!("JobFence[{}]: Signaling ({:?})", self.0.id, result);
        *status = Some(result);
        self.0.cond.notify_all();
        true
    }

    pub fn is_signaled(&self) -> bool {
        self.0.status.lock().is_some()
    }

    /// The job's outcome, or `None` while it is still pending.
    pub fn status(&self) -> Option<core::result::Result<(), JobError>> {
        *self.0.status.lock()
    }

    /// Block until the job finishes or `timeout` elapses. A job that was finalized as failed
    /// returns its error.
    pub fn wait(&self, timeout: Duration) -> Result<WaitStatus> {
        let deadline = Instant::now() + timeout;
        let mut status = self.0.status.lock();
        while status.is_none() {
            if self.0.cond.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        match *status {
            None => Ok(WaitStatus::TimedOut),
            Some(Ok(())) => Ok(WaitStatus::Signaled),
            Some(Err(e)) => Err(Error::from(e)),
        }
    }
}

impl core::fmt::Debug for JobFence {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobFence")
            .field("job", &self.0.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signaled_once_counter_reaches_seqno() {
        let ctx = FenceContext::new(Queue::Render);
        let mut slots = SlotTable::new();
        let a = ctx.create(&mut slots);
        let b = ctx.create(&mut slots);
        assert_eq!((a.seqno(), b.seqno()), (1, 2));
        assert!(!a.is_signaled());

        ctx.advance(1).unwrap();
        assert!(a.is_signaled());
        assert!(!b.is_signaled());
        assert_eq!(b.wait(Duration::from_millis(1)), WaitStatus::TimedOut);

        ctx.advance(2).unwrap();
        assert_eq!(b.wait(Duration::ZERO), WaitStatus::Signaled);
    }

    #[test]
    fn out_of_order_completion_is_rejected() {
        let ctx = FenceContext::new(Queue::Bin);
        let mut slots = SlotTable::new();
        ctx.create(&mut slots);
        ctx.create(&mut slots);

        // Never emitted.
        assert!(matches!(
            ctx.advance(3),
            Err(Error::InternalConsistency(_))
        ));
        ctx.advance(2).unwrap();
        // Duplicate and regression.
        assert!(ctx.advance(2).is_err());
        assert!(ctx.advance(1).is_err());
        assert_eq!(ctx.last_completed(), 2);
    }

    #[test]
    fn force_complete_never_moves_backwards() {
        let ctx = FenceContext::new(Queue::Csd);
        let mut slots = SlotTable::new();
        for _ in 0..3 {
            ctx.create(&mut slots);
        }
        ctx.advance(2).unwrap();
        ctx.force_complete(1);
        assert_eq!(ctx.last_completed(), 2);
        ctx.force_complete(3);
        assert_eq!(ctx.last_completed(), 3);
    }

    #[test]
    fn wait_wakes_on_advance() {
        let ctx = FenceContext::new(Queue::Tfu);
        let mut slots = SlotTable::new();
        let fence = ctx.create(&mut slots);

        let waiter = thread::spawn(move || fence.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(5));
        ctx.advance(1).unwrap();
        assert_eq!(waiter.join().unwrap(), WaitStatus::Signaled);
    }

    #[test]
    fn job_fence_keeps_first_outcome() {
        let fence = JobFence::new(7);
        assert_eq!(fence.wait(Duration::ZERO).unwrap(), WaitStatus::TimedOut);
        assert!(fence.signal(Err(JobError::TimedOut)));
        assert!(!fence.signal(Ok(())));
        assert_eq!(fence.status(), Some(Err(JobError::TimedOut)));
        assert!(matches!(
            fence.wait(Duration::ZERO),
            Err(Error::TimedOut)
        ));
    }
}
