// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Performance monitors
//!
//! A perfmon selects up to `MAX_PERF_COUNTERS` hardware events and accumulates how often they
//! occurred while jobs carrying it ran. The hardware has a single counter block, so at most one
//! perfmon is active device-wide; `PerfmonState` tracks which one.
//!
//! Starting a perfmon zeroes the hardware counters, so whatever is read back when it stops is the
//! delta for that window. Accumulated values are only ever added to.

use crate::debug::*;
use crate::error::{Error, Result};
use crate::hw::Hardware;
use parking_lot::Mutex;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Perfmon;

/// Maximum number of counters a single perfmon may select.
pub const MAX_PERF_COUNTERS: usize = 32;

/// A set of performance counters and their accumulated values.
pub struct Perfmon {
    counters: Vec<u8>,
    values: Mutex<Vec<u64>>,
}

impl Perfmon {
    /// Create a perfmon counting `counters`, each of which must be a valid event number for a
    /// device with `num_perfcnt` events.
    pub fn new(counters: &[u8], num_perfcnt: u32) -> Result<Arc<Perfmon>> {
        if counters.is_empty() || counters.len() > MAX_PERF_COUNTERS {
            cls_pr_debug!(
                Errors,
                "perfmon: counter count {} out of range [1, {}]",
                counters.len(),
                MAX_PERF_COUNTERS
            );
            return Err(Error::InvalidArgument("perfmon counter count"));
        }
        if let Some(bad) = counters.iter().find(|&&c| u32::from(c) >= num_perfcnt) {
            cls_pr_debug!(Errors, "perfmon: invalid counter {}", bad);
            return Err(Error::InvalidArgument("perfmon counter id"));
        }

        Ok(Arc::new(Perfmon {
            counters: counters.to_vec(),
            values: Mutex::new(vec![0; counters.len()]),
        }))
    }

    pub fn counters(&self) -> &[u8] {
        &self.counters
    }

    /// Accumulated values, one per counter.
    pub fn read(&self) -> Vec<u64> {
        self.values.lock().clone()
    }
}

impl core::fmt::Debug for Perfmon {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Perfmon")
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

/// Tracks the perfmon owning the hardware counters.
pub(crate) struct PerfmonState {
    active: Mutex<Option<Arc<Perfmon>>>,
}

impl PerfmonState {
    pub(crate) fn new() -> PerfmonState {
        PerfmonState {
            active: Mutex::new(None),
        }
    }

    pub(crate) fn active(&self) -> Option<Arc<Perfmon>> {
        self.active.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, perfmon: &Arc<Perfmon>) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(a, perfmon))
    }

    /// Make `perfmon` the active one. Fails with `Busy` if any perfmon is already active.
    pub(crate) fn start(&self, hw: &dyn Hardware, perfmon: &Arc<Perfmon>) -> Result {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(Error::Busy);
        }
        mod_pr_debug!("Starting {:?}", perfmon);
        hw.perfmon_start(&perfmon.counters);
        *active = Some(perfmon.clone());
        Ok(())
    }

    /// Stop `perfmon`, adding the hardware counts to its values if `capture` is set. Does nothing
    /// if it is not the active perfmon.
    pub(crate) fn stop(&self, hw: &dyn Hardware, perfmon: &Arc<Perfmon>, capture: bool) {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(a) if Arc::ptr_eq(a, perfmon) => {}
            _ => return,
        }
        Self::stop_locked(hw, perfmon, capture);
        *active = None;
    }

    /// Hand the counters to `next`: a different active perfmon is stopped with capture first.
    pub(crate) fn switch_to(&self, hw: &dyn Hardware, next: Option<&Arc<Perfmon>>) {
        let mut active = self.active.lock();
        if let Some(cur) = active.as_ref() {
            if next.is_some_and(|n| Arc::ptr_eq(n, cur)) {
                return;
            }
            Self::stop_locked(hw, cur, true);
            *active = None;
        }
        if let Some(next) = next {
            mod_pr_debug!("Switching to {:?}", next);
            hw.perfmon_start(&next.counters);
            *active = Some(next.clone());
        }
    }

    /// Stop whatever perfmon is active without capturing. Used by reset, where the hardware
    /// counts are meaningless.
    pub(crate) fn abort(&self, hw: &dyn Hardware) {
        if let Some(cur) = self.active.lock().take() {
            Self::stop_locked(hw, &cur, false);
        }
    }

    fn stop_locked(hw: &dyn Hardware, perfmon: &Perfmon, capture: bool) {
        if capture {
            let mut delta = vec![0u64; perfmon.counters.len()];
            hw.perfmon_read(&mut delta);
            let mut values = perfmon.values.lock();
            for (value, d) in values.iter_mut().zip(delta) {
                *value = value.saturating_add(d);
            }
        }
        mod_pr_debug!("Stopped {:?} (capture: {})", perfmon, capture);
        hw.perfmon_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Op, SimGpu};
    use proptest::prelude::*;

    #[test]
    fn validation() {
        assert!(Perfmon::new(&[], 87).is_err());
        assert!(Perfmon::new(&[0; MAX_PERF_COUNTERS + 1], 87).is_err());
        assert!(Perfmon::new(&[3, 87], 87).is_err());
        let pm = Perfmon::new(&[3, 86], 87).unwrap();
        assert_eq!(pm.read(), vec![0, 0]);
    }

    #[test]
    fn only_one_active() {
        let hw = SimGpu::new();
        let state = PerfmonState::new();
        let a = Perfmon::new(&[1], 87).unwrap();
        let b = Perfmon::new(&[2], 87).unwrap();

        state.start(&hw, &a).unwrap();
        assert!(matches!(state.start(&hw, &b), Err(Error::Busy)));
        // Stopping an inactive perfmon is a no-op.
        state.stop(&hw, &b, true);
        assert!(state.is_active(&a));

        hw.count_event(1, 5);
        state.switch_to(&hw, Some(&b));
        assert_eq!(a.read(), vec![5]);
        assert!(state.is_active(&b));

        hw.count_event(2, 9);
        state.abort(&hw);
        assert_eq!(b.read(), vec![0]);
        assert!(state.active().is_none());
        assert_eq!(
            hw.ops()
                .iter()
                .filter(|op| matches!(op, Op::PerfmonStop))
                .count(),
            2
        );
    }

    proptest! {
        #[test]
        fn values_never_decrease(windows in proptest::collection::vec((0u64..1000, any::<bool>()), 1..16)) {
            let hw = SimGpu::new();
            let state = PerfmonState::new();
            let pm = Perfmon::new(&[7, 8], 87).unwrap();
            let mut last = pm.read();
            let mut expected = 0;

            for (n, capture) in windows {
                state.start(&hw, &pm).unwrap();
                hw.count_event(7, n);
                state.stop(&hw, &pm, capture);
                if capture {
                    expected += n;
                }
                let now = pm.read();
                prop_assert!(now[0] >= last[0]);
                prop_assert_eq!(now[1], 0);
                last = now;
            }
            prop_assert_eq!(last[0], expected);
        }
    }
}
