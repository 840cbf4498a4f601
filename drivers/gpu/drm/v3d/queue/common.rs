// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Common queue functionality.
//!
//! Handle lookups shared by the submission paths of all job types.

use crate::bo::Bo;
use crate::error::{Error, Result};
use crate::file::File;
use crate::perfmon::Perfmon;
use std::sync::Arc;

/// Resolve the object handles of a submission.
pub(super) fn lookup_bos(file: &File, handles: &[u32]) -> Result<Vec<Arc<Bo>>> {
    let max = file.dev().params().max_bos_per_job;
    if handles.is_empty() || handles.len() > max {
        cls_pr_debug!(
            Errors,
            "submit: object count {} out of valid range [1, {}]",
            handles.len(),
            max
        );
        return Err(Error::InvalidSubmission("object count"));
    }

    let bos = file.bos().lock();
    handles
        .iter()
        .map(|handle| {
            bos.get(handle).cloned().ok_or_else(|| {
                cls_pr_debug!(Errors, "submit: invalid object handle {}", handle);
                Error::NoEntry
            })
        })
        .collect()
}

/// Resolve an optional perfmon id. Id 0 means no perfmon.
pub(super) fn lookup_perfmon(file: &File, id: u32) -> Result<Option<Arc<Perfmon>>> {
    if id == 0 {
        return Ok(None);
    }
    file.perfmons()
        .lock()
        .get(&id)
        .cloned()
        .map(Some)
        .ok_or_else(|| {
            cls_pr_debug!(Errors, "submit: invalid perfmon id {}", id);
            Error::NoEntry
        })
}
