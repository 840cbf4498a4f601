// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Debug classes and logging helpers
//!
//! Every module selects a class with `const DEBUG_CLASS: DebugFlags = DebugFlags::...;` and logs
//! through the macros below. Each class is a `log` target, so output can be filtered per subsystem
//! by whatever `log` backend the embedding program installs (e.g. `v3d::sched=debug`).

/// Driver subsystems that can be traced independently.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DebugFlags {
    Device,
    Fence,
    Mmu,
    Bo,
    Job,
    Queue,
    Sched,
    Irq,
    Perfmon,
    Stats,
    File,
    Errors,
}

impl DebugFlags {
    /// The `log` target used for this class.
    pub(crate) const fn target(self) -> &'static str {
        match self {
            DebugFlags::Device => "v3d::device",
            DebugFlags::Fence => "v3d::fence",
            DebugFlags::Mmu => "v3d::mmu",
            DebugFlags::Bo => "v3d::bo",
            DebugFlags::Job => "v3d::job",
            DebugFlags::Queue => "v3d::queue",
            DebugFlags::Sched => "v3d::sched",
            DebugFlags::Irq => "v3d::irq",
            DebugFlags::Perfmon => "v3d::perfmon",
            DebugFlags::Stats => "v3d::stats",
            DebugFlags::File => "v3d::file",
            DebugFlags::Errors => "v3d::errors",
        }
    }
}

/// Debug message in the calling module's class.
macro_rules! mod_pr_debug {
    ($($arg:tt)*) => {
        ::log::debug!(target: DEBUG_CLASS.target(), $($arg)*)
    };
}

/// Debug message in the calling module's class, prefixed with the device name.
macro_rules! mod_dev_dbg {
    ($dev:expr, $($arg:tt)*) => {
        ::log::debug!(
            target: DEBUG_CLASS.target(),
            "{}: {}",
            $dev.name(),
            format_args!($($arg)*)
        )
    };
}

/// Debug message in an explicit class, regardless of the calling module.
macro_rules! cls_pr_debug {
    ($cls:ident, $($arg:tt)*) => {
        ::log::debug!(
            target: $crate::debug::DebugFlags::$cls.target(),
            $($arg)*
        )
    };
}

macro_rules! dev_info {
    ($dev:expr, $($arg:tt)*) => {
        ::log::info!(target: DEBUG_CLASS.target(), "{}: {}", $dev.name(), format_args!($($arg)*))
    };
}

macro_rules! dev_warn {
    ($dev:expr, $($arg:tt)*) => {
        ::log::warn!(target: DEBUG_CLASS.target(), "{}: {}", $dev.name(), format_args!($($arg)*))
    };
}

macro_rules! dev_err {
    ($dev:expr, $($arg:tt)*) => {
        ::log::error!(target: DEBUG_CLASS.target(), "{}: {}", $dev.name(), format_args!($($arg)*))
    };
}

macro_rules! pr_err {
    ($($arg:tt)*) => {
        ::log::error!(target: DEBUG_CLASS.target(), $($arg)*)
    };
}
