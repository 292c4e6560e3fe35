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

//! Scheduler configuration.

use std::time::Duration;

/// Configuration for a [`Scheduler`](crate::scheduler::Scheduler) instance.
///
/// The fetch window of the polling engine is derived from the worker pool
/// size rather than fixed: each poll fetches up to
/// `worker_pool_size * upper_limit_fraction` due executions, and an
/// out-of-cycle refetch is triggered once a batch has
/// `worker_pool_size * lower_limit_fraction` or fewer candidates left.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity written into `picked_by` when this process claims an
    /// execution. Hostname resolution is the caller's concern; any stable,
    /// process-unique string works.
    pub scheduler_name: String,

    /// Maximum number of concurrently executing task bodies. Claim attempts
    /// and async continuations share the same budget.
    pub worker_pool_size: usize,

    /// How often the polling engine checks the store for due executions.
    pub poll_interval: Duration,

    /// How often heartbeats are written for in-flight executions, and how
    /// often the dead-execution sweep runs.
    pub heartbeat_interval: Duration,

    /// Number of missed heartbeats before a picked execution is considered
    /// dead and handed to its task's dead-execution handler.
    pub missed_heartbeats_limit: u32,

    /// How long `stop()` waits for in-flight executions before aborting them.
    pub shutdown_max_wait: Duration,

    /// Replenish threshold as a fraction of the worker pool size.
    pub lower_limit_fraction: f64,

    /// Fetch ceiling as a fraction of the worker pool size.
    pub upper_limit_fraction: f64,
}

impl SchedulerConfig {
    /// Configuration with defaults for everything except the scheduler name.
    pub fn new(scheduler_name: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            ..Default::default()
        }
    }

    /// Replenish threshold for a batch, derived from the pool size.
    pub(crate) fn lower_limit(&self) -> usize {
        (self.worker_pool_size as f64 * self.lower_limit_fraction) as usize
    }

    /// Fetch ceiling per poll, derived from the pool size. Always at least 1.
    pub(crate) fn upper_limit(&self) -> usize {
        ((self.worker_pool_size as f64 * self.upper_limit_fraction) as usize).max(1)
    }

    /// Age after which a picked execution with no heartbeat is considered dead.
    pub(crate) fn max_age_before_considered_dead(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats_limit
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_name: "camshaft".to_string(),
            worker_pool_size: 10,
            poll_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(300),
            missed_heartbeats_limit: 6,
            shutdown_max_wait: Duration::from_secs(30),
            lower_limit_fraction: 0.5,
            upper_limit_fraction: 3.0,
        }
    }
}
