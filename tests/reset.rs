// SPDX-License-Identifier: GPL-2.0-only OR MIT

mod common;

use common::{Harness, MS};
use std::time::Duration;
use v3d::hw::Progress;
use v3d::queue::render::SubmitCl;
use v3d::sim::Op;
use v3d::{Error, File, JobError, Queue, QueueState};

fn render_only(file: &File) -> SubmitCl {
    SubmitCl {
        rcl_start: 0x2000,
        rcl_end: 0x2400,
        bo_handles: vec![file.bo_create(4096).unwrap()],
        ..Default::default()
    }
}

#[test]
fn stuck_job_resets_the_gpu() {
    let h = Harness::with_json(r#"{"timeouts_ms": {"tfu": 10}}"#);
    let job = h.submit_tfu(1);

    h.hw.advance(5 * MS);
    h.dev.check_timeouts().unwrap();
    assert_eq!(h.dev.reset_count(), 0);
    assert_eq!(h.dev.queue_state(Queue::Tfu), QueueState::Active);

    h.hw.advance(6 * MS);
    h.hw.take_ops();
    h.dev.check_timeouts().unwrap();

    let ops = h.hw.take_ops();
    assert!(matches!(
        ops.as_slice(),
        [
            Op::IrqDisable,
            Op::Isolate,
            Op::Reset,
            Op::SetPageTable { .. },
            Op::MmuFlush,
            Op::IrqReset,
            Op::IrqEnable,
        ]
    ));
    assert!(h.hw.irq_enabled());
    assert_eq!(h.dev.reset_count(), 1);
    assert_eq!(h.dev.queue_state(Queue::Tfu), QueueState::Idle);
    assert_eq!(job.fence().status(), Some(Err(JobError::TimedOut)));
    assert!(matches!(
        job.fence().wait(Duration::ZERO),
        Err(Error::TimedOut)
    ));
    assert!(!job.bos()[0].is_pinned());

    let ctx = h.dev.fence_context(Queue::Tfu);
    assert_eq!(ctx.last_completed(), ctx.last_emitted());

    // The queue works again after the reset.
    let next = h.submit_tfu(1);
    h.complete(Queue::Tfu).unwrap();
    assert_eq!(next.fence().status(), Some(Ok(())));
}

#[test]
fn progressing_job_is_given_more_time() {
    let h = Harness::with_json(r#"{"timeouts_ms": {"render": 10}}"#);
    let file = File::open(&h.dev, 5);
    let done = file.submit_cl(&render_only(&file)).unwrap();

    h.hw.set_progress(
        Queue::Render,
        Progress {
            ctca: 0x2100,
            ctra: 0,
            batches: 0,
        },
    );
    h.hw.advance(15 * MS);
    h.dev.check_timeouts().unwrap();
    assert_eq!(h.dev.reset_count(), 0);

    // The timer restarted at the last check.
    h.hw.advance(5 * MS);
    h.dev.check_timeouts().unwrap();
    assert_eq!(h.dev.reset_count(), 0);

    // Same addresses as last time: stuck.
    h.hw.advance(10 * MS);
    h.dev.check_timeouts().unwrap();
    assert_eq!(h.dev.reset_count(), 1);
    assert_eq!(done.status(), Some(Err(JobError::TimedOut)));
}

#[test]
fn compute_progress_is_counted_in_batches() {
    let h = Harness::with_json(r#"{"timeouts_ms": {"csd": 10}}"#);
    let file = File::open(&h.dev, 5);
    let handle = file.bo_create(4096).unwrap();
    let done = file
        .submit_csd(&v3d::queue::compute::SubmitCsd {
            bo_handles: vec![handle],
            ..Default::default()
        })
        .unwrap();

    h.hw.set_progress(
        Queue::Csd,
        Progress {
            ctca: 0,
            ctra: 0,
            batches: 12,
        },
    );
    h.hw.advance(11 * MS);
    h.dev.check_timeouts().unwrap();
    assert_eq!(h.dev.reset_count(), 0);

    h.hw.advance(11 * MS);
    h.dev.check_timeouts().unwrap();
    assert_eq!(h.dev.reset_count(), 1);
    // The cache clean job after the failed dispatch is canceled.
    assert_eq!(done.status(), Some(Err(JobError::Canceled)));
}

#[test]
fn other_queues_are_restarted_after_a_reset() {
    let h = Harness::with_json(r#"{"timeouts_ms": {"tfu": 10}}"#);
    let file = File::open(&h.dev, 5);
    let handle = file.bo_create(4096).unwrap();
    let render_done = file
        .submit_cl(&SubmitCl {
            bcl_start: 0x1000,
            bcl_end: 0x1200,
            rcl_start: 0x2000,
            rcl_end: 0x2400,
            bo_handles: vec![handle],
            ..Default::default()
        })
        .unwrap();
    let tfu = h.submit_tfu(1);

    h.hw.advance(20 * MS);
    h.dev.check_timeouts().unwrap();

    assert_eq!(tfu.fence().status(), Some(Err(JobError::TimedOut)));
    let bin_kicks = h.hw.kicks(Queue::Bin);
    assert_eq!(bin_kicks.len(), 2);
    assert_eq!(bin_kicks[0], bin_kicks[1]);
    assert_eq!(h.dev.queue_state(Queue::Bin), QueueState::Active);

    // The restarted job is timed from the reset.
    assert_eq!(h.dev.params().timeouts_ms.bin, 500);
    h.hw.advance(499 * MS);
    h.dev.check_timeouts().unwrap();
    assert_eq!(h.dev.reset_count(), 1);

    h.complete(Queue::Bin).unwrap();
    h.complete(Queue::Render).unwrap();
    assert_eq!(render_done.status(), Some(Ok(())));
}

#[test]
fn restarted_render_job_sees_fresh_caches() {
    let h = Harness::with_json(r#"{"timeouts_ms": {"tfu": 10}}"#);
    let file = File::open(&h.dev, 5);
    file.submit_cl(&render_only(&file)).unwrap();
    h.submit_tfu(1);

    h.hw.advance(20 * MS);
    h.hw.take_ops();
    h.dev.check_timeouts().unwrap();

    let ops = h.hw.take_ops();
    assert!(matches!(
        ops.as_slice(),
        [
            ..,
            Op::IrqEnable,
            Op::InvalidateCaches,
            Op::Kick(Queue::Render, _)
        ]
    ));
}

#[test]
fn failed_reset_loses_the_device() {
    let h = Harness::with_json(r#"{"timeouts_ms": {"tfu": 10}, "reset_timeout_ms": 1}"#);
    let file = File::open(&h.dev, 5);
    let render_done = file.submit_cl(&render_only(&file)).unwrap();
    let stuck = h.submit_tfu(1);
    let queued = h.submit_tfu(1);

    h.hw.break_reset();
    h.hw.advance(20 * MS);
    assert!(matches!(h.dev.check_timeouts(), Err(Error::TimedOut)));

    assert!(h.dev.is_crashed());
    assert_eq!(stuck.fence().status(), Some(Err(JobError::Lost)));
    assert_eq!(queued.fence().status(), Some(Err(JobError::Lost)));
    assert_eq!(render_done.status(), Some(Err(JobError::Lost)));
    for queue in Queue::ALL {
        assert_eq!(h.dev.queue_state(queue), QueueState::Idle);
        assert_eq!(h.dev.queued_jobs(queue), 0);
    }

    assert!(matches!(h.dev.check_timeouts(), Err(Error::NoDevice)));
    assert!(matches!(
        file.submit_cl(&render_only(&file)),
        Err(Error::NoDevice)
    ));
}

#[test]
fn fault_during_a_hang_is_reported_as_fault() {
    let h = Harness::with_json(r#"{"timeouts_ms": {"tfu": 10}}"#);
    let job = h.submit_tfu(1);
    let fault = v3d::hw::FaultInfo {
        address: 0x1000,
        queue: Some(Queue::Tfu),
        write: false,
    };
    h.dev
        .handle_irq(v3d::IrqEvent::MmuFault(fault))
        .unwrap();

    h.hw.advance(20 * MS);
    h.dev.check_timeouts().unwrap();
    assert_eq!(job.fence().status(), Some(Err(JobError::Fault(fault))));
}

#[test]
fn watchdog_thread_resets_stuck_jobs() {
    let h = Harness::with_json(r#"{"timeouts_ms": {"tfu": 10}}"#);
    let job = h.submit_tfu(1);
    h.hw.advance(20 * MS);

    let watchdog = h.dev.start_watchdog(Duration::from_millis(1)).unwrap();
    let status = job.fence().wait(Duration::from_secs(10)).unwrap_err();
    assert!(matches!(status, Error::TimedOut));
    drop(watchdog);

    assert_eq!(h.dev.reset_count(), 1);
}
