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

//! Policy handlers: the state machine of an execution's destiny.
//!
//! Three hook points convert an execution outcome into the next durable
//! state of its row:
//!
//! - a successful task body returns a [`Completion`] value;
//! - a failed attempt is routed to the task's [`FailureHandler`];
//! - an orphaned (dead) execution is handed to the task's
//!   [`DeadExecutionHandler`] by the sweep.
//!
//! Handlers are pure strategies: they hold no mutable state and only write
//! through [`ExecutionOperations`]. An error raised *by a handler* is
//! contained at the pipeline boundary: the execution stays picked and the
//! dead-execution sweep is its only path back to a runnable state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::schedule::Schedule;
use crate::error::HandlerError;
use crate::execution::{Execution, ExecutionComplete, ExecutionOperations};

/// Key under which [`RescheduleUsingTaskData`] expects a [`Schedule`] in
/// the task's persisted payload.
pub const TASK_DATA_SCHEDULE_KEY: &str = "schedule";

/// What a successfully finished execution becomes.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Delete the row. Terminal state for one-time tasks.
    Remove,
    /// Run again at the schedule's next time after completion, optionally
    /// replacing the payload.
    Reschedule {
        schedule: Schedule,
        new_data: Option<Value>,
    },
    /// Run again at an explicit instant.
    RescheduleTo {
        next_time: DateTime<Utc>,
        new_data: Option<Value>,
    },
}

impl Completion {
    /// Shorthand for rescheduling on a schedule without replacing data.
    pub fn reschedule(schedule: Schedule) -> Self {
        Completion::Reschedule {
            schedule,
            new_data: None,
        }
    }

    pub(crate) async fn apply(
        &self,
        complete: &ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<(), HandlerError> {
        match self {
            Completion::Remove => ops.remove().await,
            Completion::Reschedule { schedule, new_data } => {
                let next_time = schedule.next_execution_time(complete.time_done)?;
                ops.reschedule(complete, next_time, new_data.clone()).await
            }
            Completion::RescheduleTo {
                next_time,
                new_data,
            } => ops.reschedule(complete, *next_time, new_data.clone()).await,
        }
    }
}

/// Policy for attempts that raised an error.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_failure(
        &self,
        complete: &ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<(), HandlerError>;
}

/// Retry a fixed delay after the failure.
///
/// The execution is written back unpicked with
/// `execution_time = failure time + delay` and `consecutive_failures`
/// incremented.
#[derive(Debug, Clone)]
pub struct RetryLater {
    delay: Duration,
}

impl RetryLater {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl FailureHandler for RetryLater {
    async fn on_failure(
        &self,
        complete: &ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<(), HandlerError> {
        let delay = chrono::Duration::from_std(self.delay)
            .map_err(|e| HandlerError::Other(anyhow::anyhow!("retry delay out of range: {e}")))?;
        let next_time = complete.time_done + delay;
        debug!(
            execution = %complete.execution.task_instance.task_and_instance(),
            retry_at = %next_time,
            "Execution failed, retrying later"
        );
        ops.reschedule(complete, next_time, None).await
    }
}

/// Defer to the recurring schedule: the failed run is skipped and the next
/// run happens at the schedule's regular next time.
#[derive(Debug, Clone)]
pub struct RescheduleOnFailure {
    schedule: Schedule,
}

impl RescheduleOnFailure {
    pub fn new(schedule: Schedule) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl FailureHandler for RescheduleOnFailure {
    async fn on_failure(
        &self,
        complete: &ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<(), HandlerError> {
        let next_time = self.schedule.next_execution_time(complete.time_done)?;
        ops.reschedule(complete, next_time, None).await
    }
}

/// Reschedule using a schedule embedded in the task's own persisted data,
/// under the `"schedule"` key.
///
/// This makes each instance self-describing: two instances of the same task
/// can recur on different cadences.
#[derive(Debug, Clone, Copy, Default)]
pub struct RescheduleUsingTaskData;

impl RescheduleUsingTaskData {
    fn schedule_from(execution: &Execution) -> Result<Schedule, HandlerError> {
        let raw = execution
            .task_instance
            .data
            .get(TASK_DATA_SCHEDULE_KEY)
            .ok_or_else(|| {
                HandlerError::InvalidTaskData(format!(
                    "no '{TASK_DATA_SCHEDULE_KEY}' field in task data for {}",
                    execution.task_instance.task_and_instance()
                ))
            })?;
        serde_json::from_value(raw.clone()).map_err(|e| {
            HandlerError::InvalidTaskData(format!(
                "malformed '{TASK_DATA_SCHEDULE_KEY}' field for {}: {e}",
                execution.task_instance.task_and_instance()
            ))
        })
    }
}

#[async_trait]
impl FailureHandler for RescheduleUsingTaskData {
    async fn on_failure(
        &self,
        complete: &ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<(), HandlerError> {
        let schedule = Self::schedule_from(&complete.execution)?;
        let next_time = schedule.next_execution_time(complete.time_done)?;
        ops.reschedule(complete, next_time, None).await
    }
}

/// Give up after a bounded number of consecutive failures.
///
/// Delegates to `inner` until the attempt about to be recorded would reach
/// `limit` consecutive failures, then removes the execution instead.
#[derive(Clone)]
pub struct MaxRetries {
    limit: i32,
    inner: Arc<dyn FailureHandler>,
}

impl MaxRetries {
    pub fn new(limit: i32, inner: impl FailureHandler + 'static) -> Self {
        Self {
            limit,
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl FailureHandler for MaxRetries {
    async fn on_failure(
        &self,
        complete: &ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<(), HandlerError> {
        let failures_including_this = complete.execution.consecutive_failures + 1;
        if failures_including_this >= self.limit {
            warn!(
                execution = %complete.execution.task_instance.task_and_instance(),
                failures = failures_including_this,
                "Execution has reached the max retry limit, cancelling"
            );
            ops.remove().await
        } else {
            self.inner.on_failure(complete, ops).await
        }
    }
}

/// Policy for executions whose owner process is presumed crashed.
#[async_trait]
pub trait DeadExecutionHandler: Send + Sync {
    async fn on_dead(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
        ops: &ExecutionOperations,
    ) -> Result<(), HandlerError>;
}

/// Clear the pick and make the execution due again, returning it to the
/// candidate pool. The default dead-execution policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReviveDeadExecution;

#[async_trait]
impl DeadExecutionHandler for ReviveDeadExecution {
    async fn on_dead(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
        ops: &ExecutionOperations,
    ) -> Result<(), HandlerError> {
        warn!(
            execution = %execution.task_instance.task_and_instance(),
            picked_by = execution.picked_by.as_deref().unwrap_or("unknown"),
            "Reviving dead execution"
        );
        ops.revive(now).await
    }
}
