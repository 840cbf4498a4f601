// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Driver parameters
//!
//! Tunables that a kernel driver would expose as module parameters. They are fixed for the
//! lifetime of a device and can be loaded from JSON, with every field optional.

use crate::error::Result;
use crate::queue::Queue;
use core::time::Duration;
use serde::Deserialize;

/// Per-queue watchdog thresholds, in milliseconds.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueTimeouts {
    pub bin: u64,
    pub render: u64,
    pub tfu: u64,
    pub csd: u64,
    pub cache_clean: u64,
}

impl Default for QueueTimeouts {
    fn default() -> Self {
        Self {
            bin: 500,
            render: 500,
            tfu: 500,
            csd: 500,
            cache_clean: 500,
        }
    }
}

/// Device-wide driver parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Params {
    /// Watchdog thresholds per queue.
    pub timeouts_ms: QueueTimeouts,
    /// How long per-process accounting stays enabled after an observation, and how long an idle
    /// per-process entry survives.
    pub stats_window_ms: u64,
    /// Upper bound on waiting for the hardware to report reset completion.
    pub reset_timeout_ms: u64,
    /// Maximum number of resources a single job may reference.
    pub max_bos_per_job: usize,
    /// Overrides the address width reported by the hardware, to shrink the page table.
    pub va_width: Option<u32>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            timeouts_ms: Default::default(),
            stats_window_ms: 70_000,
            reset_timeout_ms: 100,
            max_bos_per_job: 4096,
            va_width: None,
        }
    }
}

impl Params {
    /// Parse parameters from a JSON object. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Params> {
        Ok(serde_json::from_str(json)?)
    }

    /// Watchdog threshold for a queue, in nanoseconds.
    pub(crate) fn timeout_ns(&self, queue: Queue) -> u64 {
        let ms = match queue {
            Queue::Bin => self.timeouts_ms.bin,
            Queue::Render => self.timeouts_ms.render,
            Queue::Tfu => self.timeouts_ms.tfu,
            Queue::Csd => self.timeouts_ms.csd,
            Queue::CacheClean => self.timeouts_ms.cache_clean,
        };
        ms.saturating_mul(1_000_000)
    }

    pub(crate) fn stats_window_ns(&self) -> u64 {
        self.stats_window_ms.saturating_mul(1_000_000)
    }

    pub(crate) fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let params = Params::from_json("{}").unwrap();
        assert_eq!(params, Params::default());
        assert_eq!(params.timeout_ns(Queue::Render), 500_000_000);
        assert_eq!(params.stats_window_ns(), 70_000_000_000);
    }

    #[test]
    fn partial_override() {
        let params =
            Params::from_json(r#"{"timeouts_ms": {"csd": 20}, "va_width": 24}"#).unwrap();
        assert_eq!(params.timeouts_ms.csd, 20);
        assert_eq!(params.timeouts_ms.bin, 500);
        assert_eq!(params.va_width, Some(24));
        assert_eq!(params.timeout_ns(Queue::Csd), 20_000_000);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = Params::from_json(r#"{"stats_window_ms": "soon"}"#).unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }
}
