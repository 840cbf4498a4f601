// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Driver for the Broadcom V3D GPU
//!
//! This crate is the job submission and completion core of the driver. Jobs for the binner,
//! renderer, texture format unit, compute dispatch and cache clean queues are queued per client,
//! issued one at a time per queue, completed from interrupts, and recovered with a GPU reset when
//! they hang. It also manages the shared GPU address space, multiplexes the performance counters
//! and accounts GPU time per process.
//!
//! Register access, interrupt wiring and memory allocation are reached through the
//! [`hw::Hardware`] trait. [`sim::SimGpu`] implements it in software.
//!
//! Module layout:
//! - device: the per-GPU object and lock ordering.
//! - sched: submission, completion, watchdog and reset.
//! - irq: interrupt event handling.
//! - queue: queues, slots and the per-type jobs.
//! - fence, job, mmu, bo, perfmon, stats: the objects those operate on.
//! - file: per-client handles and submit entry points.

#[macro_use]
mod debug;

pub mod bo;
pub mod device;
pub mod error;
pub mod fence;
pub mod file;
pub mod hw;
pub mod irq;
pub mod job;
pub mod mmu;
pub mod params;
pub mod perfmon;
pub mod queue;
pub mod sched;
pub mod sim;
pub mod stats;
mod util;

pub use device::V3dDevice;
pub use error::{Error, JobError, Result};
pub use fence::{Fence, JobFence, WaitStatus};
pub use file::File;
pub use irq::IrqEvent;
pub use job::{Job, JobKind, JobRef};
pub use params::Params;
pub use queue::{Queue, QueueState};
pub use sched::Watchdog;
