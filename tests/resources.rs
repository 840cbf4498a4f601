// SPDX-License-Identifier: GPL-2.0-only OR MIT

mod common;

use common::{Harness, MS};
use proptest::prelude::*;
use std::thread;
use std::time::Duration;
use v3d::irq::BIN_OVERFLOW_SIZE;
use v3d::mmu::PAGE_SIZE;
use v3d::queue::render::SubmitCl;
use v3d::sim::Op;
use v3d::{Error, File, IrqEvent, Queue, QueueState, WaitStatus};

fn bin_and_render(file: &File, perfmon_id: u32) -> SubmitCl {
    SubmitCl {
        bcl_start: 0x1000,
        bcl_end: 0x1200,
        rcl_start: 0x2000,
        rcl_end: 0x2400,
        bo_handles: vec![file.bo_create(2 * PAGE_SIZE).unwrap()],
        perfmon_id,
        ..Default::default()
    }
}

#[test]
fn overflow_memory_lives_until_the_render_job_is_gone() {
    let h = Harness::new();
    let file = File::open(&h.dev, 9);
    let args = SubmitCl {
        flush_cache: true,
        ..bin_and_render(&file, 0)
    };
    let done = file.submit_cl(&args).unwrap();
    let baseline = h.dev.mmu().mapped_bos();

    h.dev.handle_irq(IrqEvent::BinOutOfMemory).unwrap();
    h.dev.handle_irq(IrqEvent::BinOutOfMemory).unwrap();
    assert_eq!(h.dev.mmu().mapped_bos(), baseline + 2);

    let overflows: Vec<_> = h
        .hw
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            Op::BinOverflow { address, size } => Some((address, size)),
            _ => None,
        })
        .collect();
    assert_eq!(overflows.len(), 2);
    assert!(overflows
        .iter()
        .all(|&(_, size)| size as usize == BIN_OVERFLOW_SIZE));
    assert_ne!(overflows[0].0, overflows[1].0);

    // The bin job is gone, the render job still reads the tile lists.
    h.complete(Queue::Bin).unwrap();
    assert_eq!(h.dev.queue_state(Queue::Render), QueueState::Active);
    assert_eq!(h.dev.mmu().mapped_bos(), baseline + 2);

    h.complete(Queue::Render).unwrap();
    assert_eq!(done.status(), Some(Ok(())));
    assert_eq!(h.dev.mmu().mapped_bos(), baseline);
}

#[test]
fn bin_oom_without_a_bin_job_is_harmless() {
    let h = Harness::new();
    let baseline = h.dev.mmu().mapped_bos();
    h.dev.handle_irq(IrqEvent::BinOutOfMemory).unwrap();
    assert_eq!(h.dev.mmu().mapped_bos(), baseline);
    assert!(!h
        .hw
        .ops()
        .iter()
        .any(|op| matches!(op, Op::BinOverflow { .. })));
}

#[test]
fn perfmon_jobs_own_the_gpu() {
    let h = Harness::new();
    let file = File::open(&h.dev, 9);
    let pm = file.perfmon_create(&[3]).unwrap();

    let first = h.submit_tfu(1);
    let done = file.submit_cl(&bin_and_render(&file, pm)).unwrap();
    // Waits for the GPU to go idle.
    assert!(h.hw.kicks(Queue::Bin).is_empty());

    h.complete(Queue::Tfu).unwrap();
    assert!(first.fence().is_signaled());
    assert_eq!(h.hw.kicks(Queue::Bin).len(), 1);
    assert!(h.hw.ops().contains(&Op::PerfmonStart(vec![3])));

    // Nothing else runs next to it.
    let blocked = h.submit_tfu(1);
    assert_eq!(h.hw.kicks(Queue::Tfu).len(), 1);
    assert_eq!(h.dev.queued_jobs(Queue::Tfu), 1);

    h.hw.count_event(3, 40);
    h.hw.count_event(4, 1000);
    h.complete(Queue::Bin).unwrap();
    assert_eq!(file.perfmon_get_values(pm).unwrap(), vec![40]);

    // The render job of the same submission goes next and counts on top.
    assert_eq!(h.hw.kicks(Queue::Render).len(), 1);
    assert_eq!(h.hw.kicks(Queue::Tfu).len(), 1);
    h.hw.count_event(3, 2);
    h.complete(Queue::Render).unwrap();
    assert_eq!(done.status(), Some(Ok(())));
    assert_eq!(file.perfmon_get_values(pm).unwrap(), vec![42]);
    assert!(h.dev.active_perfmon().is_none());

    assert_eq!(h.hw.kicks(Queue::Tfu).len(), 2);
    h.complete(Queue::Tfu).unwrap();
    assert!(blocked.fence().is_signaled());
}

#[test]
fn manual_perfmon_is_exclusive() {
    let h = Harness::new();
    let file = File::open(&h.dev, 9);
    let a = file.perfmon_create(&[1, 2]).unwrap();
    let b = file.perfmon_create(&[5]).unwrap();

    let pa = h.dev.new_perfmon(&[1, 2]).unwrap();
    let pb = h.dev.new_perfmon(&[5]).unwrap();
    h.dev.perfmon_start(&pa).unwrap();
    assert!(matches!(h.dev.perfmon_start(&pb), Err(Error::Busy)));

    h.hw.count_event(2, 7);
    h.dev.perfmon_stop(&pb, true);
    assert!(h.dev.active_perfmon().is_some());
    h.dev.perfmon_stop(&pa, true);
    assert_eq!(pa.read(), vec![0, 7]);
    assert!(h.dev.active_perfmon().is_none());

    file.perfmon_destroy(a).unwrap();
    assert!(matches!(file.perfmon_get_values(a), Err(Error::NoEntry)));
    assert_eq!(file.perfmon_get_values(b).unwrap(), vec![0]);
    assert!(matches!(
        file.perfmon_create(&[200]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn next_job_takes_the_counters_from_a_manual_perfmon() {
    let h = Harness::new();
    let pm = h.dev.new_perfmon(&[4]).unwrap();
    h.dev.perfmon_start(&pm).unwrap();
    h.hw.count_event(4, 11);

    let job = h.submit_tfu(1);
    assert!(h.dev.active_perfmon().is_none());
    assert_eq!(pm.read(), vec![11]);

    // Counting is off while the job runs.
    h.hw.count_event(4, 5);
    h.complete(Queue::Tfu).unwrap();
    assert!(job.fence().is_signaled());
    assert_eq!(pm.read(), vec![11]);
}

#[test]
fn destroying_the_active_perfmon_stops_it() {
    let h = Harness::new();
    let file = File::open(&h.dev, 9);
    let pm = file.perfmon_create(&[3]).unwrap();
    file.submit_cl(&bin_and_render(&file, pm)).unwrap();
    assert!(h.dev.active_perfmon().is_some());

    file.perfmon_destroy(pm).unwrap();
    assert!(h.dev.active_perfmon().is_none());
    assert_eq!(h.hw.ops().last(), Some(&Op::PerfmonStop));

    // The job still completes.
    h.complete(Queue::Bin).unwrap();
}

#[test]
fn unknown_handles_are_rejected() {
    let h = Harness::new();
    let file = File::open(&h.dev, 9);
    let mut args = bin_and_render(&file, 0);
    args.bo_handles.push(77);
    assert!(matches!(file.submit_cl(&args), Err(Error::NoEntry)));

    let args = bin_and_render(&file, 12);
    assert!(matches!(file.submit_cl(&args), Err(Error::NoEntry)));

    let args = SubmitCl {
        rcl_end: 0x2000,
        ..bin_and_render(&file, 0)
    };
    assert!(matches!(
        file.submit_cl(&args),
        Err(Error::InvalidSubmission(_))
    ));
    assert!(h.hw.kicks(Queue::Bin).is_empty());
}

#[test]
fn closed_objects_stay_mapped_while_in_use() {
    let h = Harness::new();
    let file = File::open(&h.dev, 9);
    let args = bin_and_render(&file, 0);
    let handle = args.bo_handles[0];
    let offset = file.bo_offset(handle).unwrap();
    let baseline = h.dev.mmu().mapped_bos();

    file.submit_cl(&args).unwrap();
    file.bo_close(handle).unwrap();
    assert!(matches!(file.bo_offset(handle), Err(Error::NoEntry)));
    assert_eq!(h.dev.mmu().mapped_bos(), baseline);
    assert!(h.dev.mmu().pte(offset).is_some());

    h.complete(Queue::Bin).unwrap();
    h.complete(Queue::Render).unwrap();
    assert_eq!(h.dev.mmu().mapped_bos(), baseline - 1);
    assert_eq!(h.dev.mmu().pte(offset), Some(h.dev.mmu().scratch_pte()));
}

#[test]
fn waiting_for_an_object_returns_once_its_jobs_are_done() {
    let h = Harness::new();
    let file = File::open(&h.dev, 9);
    let handle = file.bo_create(PAGE_SIZE).unwrap();
    let idle = file.bo_create(PAGE_SIZE).unwrap();
    let done = file
        .submit_csd(&v3d::queue::compute::SubmitCsd {
            bo_handles: vec![handle],
            ..Default::default()
        })
        .unwrap();

    assert_eq!(
        file.bo_wait(handle, Duration::ZERO).unwrap(),
        WaitStatus::TimedOut
    );
    assert_eq!(
        file.bo_wait(idle, Duration::ZERO).unwrap(),
        WaitStatus::Signaled
    );
    assert!(matches!(
        file.bo_wait(99, Duration::ZERO),
        Err(Error::NoEntry)
    ));

    thread::scope(|s| {
        let waiter = s.spawn(|| file.bo_wait(handle, Duration::from_secs(10)));
        h.complete(Queue::Csd).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), WaitStatus::Signaled);
    });
    assert_eq!(done.status(), Some(Ok(())));
}

#[test]
fn per_process_stats_are_collected_while_observed() {
    let h = Harness::new();
    let a = File::open(&h.dev, 100);
    let b = File::open(&h.dev, 200);

    // Not observed yet: only the global totals move.
    h.submit_tfu(100);
    h.hw.advance(2 * MS);
    h.complete(Queue::Tfu).unwrap();
    assert!(a.pid_stats(Queue::Tfu).is_empty());

    for (pid, ns) in [(100, 3 * MS), (200, 5 * MS), (100, MS)] {
        h.submit_tfu(pid);
        h.hw.advance(ns);
        h.complete(Queue::Tfu).unwrap();
    }

    let rows = b.pid_stats(Queue::Tfu);
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].pid, rows[0].runtime_ns, rows[0].jobs), (100, 4 * MS, 2));
    assert_eq!((rows[1].pid, rows[1].runtime_ns, rows[1].jobs), (200, 5 * MS, 1));

    let usage = h.dev.queue_usage(Queue::Tfu);
    assert_eq!(usage.jobs_sent, 4);
    assert_eq!(usage.runtime_ns, 11 * MS);
    assert_eq!(usage.last_pid, 100);
}

#[test]
fn idle_processes_are_purged() {
    let h = Harness::with_json(r#"{"stats_window_ms": 10}"#);
    h.dev.pid_stats(Queue::Tfu);

    h.submit_tfu(1);
    h.complete(Queue::Tfu).unwrap();
    assert_eq!(h.dev.pid_stats(Queue::Tfu).len(), 1);

    h.hw.advance(20 * MS);
    assert!(h.dev.pid_stats(Queue::Tfu).is_empty());
}

#[test]
fn usage_counts_the_running_job() {
    let h = Harness::new();
    h.submit_tfu(1);
    h.hw.advance(7 * MS);

    let usage = h.dev.queue_usage(Queue::Tfu);
    assert_eq!(usage.runtime_ns, 7 * MS);

    let json: serde_json::Value = serde_json::from_str(&h.dev.stats_json().unwrap()).unwrap();
    let rows = json.as_array().unwrap();
    assert_eq!(rows.len(), 5);
    let tfu = rows
        .iter()
        .find(|row| row["queue"] == "Tfu")
        .unwrap();
    assert_eq!(tfu["runtime_ns"], 7 * MS);
    assert_eq!(tfu["jobs_sent"], 1);
}

#[test]
fn va_width_override_shrinks_the_address_space() {
    let h = Harness::with_json(r#"{"va_width": 20}"#);
    assert_eq!(h.dev.mmu().num_pages(), 256);

    // Allocations start on a GMP boundary and page 0 is never handed out.
    let bo = h.dev.alloc_bo(224).unwrap();
    assert_eq!(bo.offset(), Some(32 * PAGE_SIZE as u32));
    assert!(matches!(h.dev.alloc_bo(1), Err(Error::NoSpace)));
    drop(bo);
    assert!(h.dev.alloc_bo(1).is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn mappings_never_overlap(sizes in prop::collection::vec(1usize..40, 1..24), keep in any::<u32>()) {
        let h = Harness::with_json(r#"{"va_width": 20}"#);
        let mut live = Vec::new();
        for (i, pages) in sizes.iter().enumerate() {
            match h.dev.alloc_bo(*pages) {
                Ok(bo) => live.push(bo),
                Err(Error::NoSpace) => {}
                Err(e) => return Err(TestCaseError::fail(format!("{:?}", e))),
            }
            // Free some objects along the way to fragment the space.
            if keep & (1 << (i % 32)) == 0 && !live.is_empty() {
                live.remove(0);
            }
        }

        let mut ranges: Vec<(u32, u32)> = live
            .iter()
            .map(|bo| {
                let start = bo.offset().unwrap() / PAGE_SIZE as u32;
                (start, start + bo.pages().len() as u32)
            })
            .collect();
        ranges.sort();
        prop_assert!(ranges.windows(2).all(|w| w[0].1 <= w[1].0));
        prop_assert_eq!(h.dev.mmu().mapped_bos(), live.len());

        drop(live);
        prop_assert_eq!(h.dev.mmu().mapped_bos(), 0);
        prop_assert_eq!(h.dev.mmu().free_ranges(), vec![1..256]);
    }
}
