// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Driver error types
//!
//! `Error` is what synchronous entry points return. `JobError` is what a job's completion fence
//! carries when the job was finalized without completing successfully on the hardware.

use crate::hw::FaultInfo;
use thiserror::Error;

/// Errors returned by driver entry points.
#[derive(Debug, Error)]
pub enum Error {
    /// A job was malformed and was rejected before touching the hardware.
    #[error("invalid submission: {0}")]
    InvalidSubmission(&'static str),
    /// An argument outside of a job submission was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A handle or id does not refer to a live object.
    #[error("no such object")]
    NoEntry,
    /// The object is in use (pinned by a job, or a perfmon is already active).
    #[error("resource busy")]
    Busy,
    /// The device address space has no free range large enough.
    #[error("out of device address space")]
    NoSpace,
    /// The job exceeded its queue's watchdog threshold and was failed.
    #[error("job timed out")]
    TimedOut,
    /// The hardware reported a fault while the job was running.
    #[error("device fault: {0:?}")]
    DeviceFault(FaultInfo),
    /// The job never ran because something it depended on failed.
    #[error("job canceled")]
    Canceled,
    /// The hardware rejected the job when it was issued.
    #[error("hardware rejected the job")]
    IssueFailed,
    /// The device is crashed and accepts no more work.
    #[error("device is not operational")]
    NoDevice,
    /// A sequence-number or slot-occupancy invariant was violated.
    #[error("internal consistency violation: {0}")]
    InternalConsistency(&'static str),
    /// Driver parameters could not be parsed.
    #[error("bad driver parameters: {0}")]
    Config(#[from] serde_json::Error),
    /// A driver worker thread could not be started.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the driver.
pub type Result<T = ()> = core::result::Result<T, Error>;

/// Reasons a job can be finalized as failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobError {
    /// GPU timeout (the job made no progress within its queue's threshold).
    TimedOut,
    /// GPU MMU fault (invalid access) while the job was active.
    Fault(FaultInfo),
    /// A dependency of this job failed, so it was never issued.
    Canceled,
    /// The hardware refused to start the job. The device stays usable.
    IssueFailed,
    /// The device crashed and could not be recovered.
    Lost,
}

impl From<JobError> for Error {
    fn from(err: JobError) -> Self {
        match err {
            JobError::TimedOut => Error::TimedOut,
            JobError::Fault(info) => Error::DeviceFault(info),
            JobError::Canceled => Error::Canceled,
            JobError::IssueFailed => Error::IssueFailed,
            JobError::Lost => Error::NoDevice,
        }
    }
}
