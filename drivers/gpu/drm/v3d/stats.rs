// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! GPU time accounting
//!
//! Every queue keeps global totals that are always collected. Per-process totals are more
//! expensive and are only collected while somebody is looking: each observation keeps collection
//! open for one stats window, and per-process entries that see no activity for a window are
//! purged.
//!
//! All timestamps are GPU timestamps in nanoseconds.

use crate::debug::*;
use crate::queue::{Queue, QUEUE_COUNT};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

const DEBUG_CLASS: DebugFlags = DebugFlags::Stats;

/// Global totals of one queue.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Total GPU time of completed jobs.
    pub runtime_ns: u64,
    /// Number of jobs issued to the hardware.
    pub jobs_sent: u64,
    pub last_exec_start: u64,
    pub last_exec_end: u64,
    /// Process that issued the most recent job.
    pub last_pid: u32,
}

/// Totals of one process on one queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PidStats {
    pub pid: u32,
    pub runtime_ns: u64,
    pub jobs: u64,
}

#[derive(Debug)]
struct PidEntry {
    runtime_ns: u64,
    jobs: u64,
    last_active: u64,
    purge_at: u64,
}

struct QueueAccounting {
    totals: QueueStats,
    /// Per-process collection stays on until this time.
    collect_until: u64,
    pids: BTreeMap<u32, PidEntry>,
}

impl QueueAccounting {
    fn collecting(&self, now: u64) -> bool {
        now < self.collect_until
    }

    fn purge(&mut self, queue: Queue, now: u64) {
        if !self.collecting(now) {
            if !self.pids.is_empty() {
                mod_pr_debug!("{}: collection off, dropping {} entries", queue.name(), self.pids.len());
                self.pids.clear();
            }
            return;
        }
        self.pids.retain(|pid, entry| {
            let keep = now < entry.purge_at;
            if !keep {
                mod_pr_debug!(
                    "{}: purging pid {} (idle since {})",
                    queue.name(),
                    pid,
                    entry.last_active
                );
            }
            keep
        });
    }
}

/// Accounting tables of all queues.
pub(crate) struct Stats {
    window_ns: u64,
    queues: [Mutex<QueueAccounting>; QUEUE_COUNT],
}

impl Stats {
    pub(crate) fn new(window_ns: u64) -> Stats {
        Stats {
            window_ns,
            queues: core::array::from_fn(|_| {
                Mutex::new(QueueAccounting {
                    totals: Default::default(),
                    collect_until: 0,
                    pids: BTreeMap::new(),
                })
            }),
        }
    }

    /// A job from `pid` was issued at `start`.
    pub(crate) fn job_started(&self, queue: Queue, pid: u32, start: u64) {
        let mut acct = self.queues[queue.index()].lock();
        acct.totals.jobs_sent += 1;
        acct.totals.last_exec_start = start;
        acct.totals.last_pid = pid;
    }

    /// A job from `pid` ran from `start` to `end`. `now` drives collection and purging.
    pub(crate) fn job_done(&self, queue: Queue, pid: u32, start: u64, end: u64, now: u64) {
        let runtime = end.saturating_sub(start);
        let window = self.window_ns;
        let mut acct = self.queues[queue.index()].lock();

        acct.totals.runtime_ns += runtime;
        acct.totals.last_exec_end = end;

        acct.purge(queue, now);
        if !acct.collecting(now) {
            return;
        }

        let entry = acct.pids.entry(pid).or_insert(PidEntry {
            runtime_ns: 0,
            jobs: 0,
            last_active: now,
            purge_at: 0,
        });
        entry.runtime_ns += runtime;
        entry.jobs += 1;
        entry.last_active = now;
        entry.purge_at = now.saturating_add(window);
    }

    /// Observe per-process stats, keeping collection on for another window.
    pub(crate) fn pid_stats(&self, queue: Queue, now: u64) -> Vec<PidStats> {
        let mut acct = self.queues[queue.index()].lock();
        acct.purge(queue, now);
        acct.collect_until = now.saturating_add(self.window_ns);

        acct.pids
            .iter()
            .map(|(&pid, e)| PidStats {
                pid,
                runtime_ns: e.runtime_ns,
                jobs: e.jobs,
            })
            .collect()
    }

    /// Global totals, counting the elapsed time of a job still on the hardware.
    pub(crate) fn usage(&self, queue: Queue, now: u64) -> QueueStats {
        let acct = self.queues[queue.index()].lock();
        let mut stats = acct.totals;
        if stats.last_exec_start > stats.last_exec_end {
            stats.runtime_ns += now.saturating_sub(stats.last_exec_start);
        }
        stats
    }
}
