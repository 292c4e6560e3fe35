/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Per-poll-cycle batch tracking.
//!
//! Each poll tick tags its fetched candidates with a
//! [`DueExecutionsBatch`]. The batch detects when it has been superseded by
//! a newer generation (its remaining candidates are then abandoned without
//! store calls) and fires the adaptive replenish trigger exactly once when
//! enough of its candidates have finished processing.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

pub(crate) struct DueExecutionsBatch {
    generation_number: u64,
    /// Whether the fetch filled the whole page; a partial page means the
    /// timer has nothing to offer and the trigger fires on the first
    /// completion instead.
    full_fetch: bool,
    executions_left: AtomicI64,
    trigger_limit: usize,
    stale: AtomicBool,
    triggered: AtomicBool,
}

impl DueExecutionsBatch {
    pub(crate) fn new(
        generation_number: u64,
        batch_size: usize,
        full_fetch: bool,
        trigger_limit: usize,
    ) -> Self {
        Self {
            generation_number,
            full_fetch,
            executions_left: AtomicI64::new(batch_size as i64),
            trigger_limit,
            stale: AtomicBool::new(false),
            triggered: AtomicBool::new(false),
        }
    }

    pub(crate) fn generation_number(&self) -> u64 {
        self.generation_number
    }

    pub(crate) fn is_older_generation_than(&self, current_generation: u64) -> bool {
        self.generation_number < current_generation
    }

    /// Memoized staleness: once a newer poll has superseded this batch, the
    /// flag makes the remaining candidates' checks a single atomic load.
    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Record that one of the batch's candidates finished processing
    /// (whatever the outcome), firing `trigger_replenish` the first time
    /// the remaining count reaches the trigger limit, or on the first
    /// completion if the original fetch was not a full page.
    pub(crate) fn one_execution_done(&self, trigger_replenish: impl FnOnce()) {
        let left = self.executions_left.fetch_sub(1, Ordering::SeqCst) - 1;
        let threshold_reached = !self.full_fetch || left <= self.trigger_limit as i64;
        if threshold_reached && !self.triggered.swap(true, Ordering::SeqCst) {
            trigger_replenish();
        }
    }
}
