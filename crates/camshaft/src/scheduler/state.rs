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

//! Scheduler lifecycle state.
//!
//! One atomic value, owned by the [`Scheduler`](crate::scheduler::Scheduler)
//! and read everywhere else: the polling engine and pipelines gate
//! admission of new work on it. Transitions are monotonic: the lifecycle
//! only ever moves forward.

use std::sync::atomic::{AtomicU8, Ordering};

/// Phases of a scheduler's life, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecyclePhase {
    Created = 0,
    Started = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

/// Process-wide lifecycle flags.
#[derive(Debug)]
pub struct SchedulerState {
    phase: AtomicU8,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(LifecyclePhase::Created as u8),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        match self.phase.load(Ordering::SeqCst) {
            0 => LifecyclePhase::Created,
            1 => LifecyclePhase::Started,
            2 => LifecyclePhase::ShuttingDown,
            _ => LifecyclePhase::Stopped,
        }
    }

    /// Whether `start()` has happened. Remains true through shutdown.
    pub fn is_started(&self) -> bool {
        self.phase() >= LifecyclePhase::Started
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() >= LifecyclePhase::ShuttingDown
    }

    pub fn is_stopped(&self) -> bool {
        self.phase() == LifecyclePhase::Stopped
    }

    /// Move forward to `phase`. Returns `false` when the state is already
    /// at or past it; transitions never go backwards.
    pub(crate) fn advance_to(&self, phase: LifecyclePhase) -> bool {
        let target = phase as u8;
        let previous = self.phase.fetch_max(target, Ordering::SeqCst);
        previous < target
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}
