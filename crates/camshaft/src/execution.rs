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

//! Execution Model
//!
//! This module defines the data structures that flow through the scheduler:
//! the durable [`Execution`] record, the per-attempt [`ExecutionComplete`]
//! event, the in-flight [`CurrentlyExecuting`] registration, and the
//! [`ExecutionOperations`] handle that policy handlers use to write an
//! execution's next durable state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HandlerError;
use crate::events::ListenerRegistry;
use crate::store::ExecutionStore;

/// One schedulable unit of work: a task name, an instance id and an opaque
/// payload.
///
/// Identity is `(task_name, id)` and is globally unique across the store.
/// Instances are immutable; a reschedule may replace the payload wholesale
/// but never mutates it in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub task_name: String,
    pub id: String,
    pub data: Value,
}

impl TaskInstance {
    pub fn new(task_name: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            task_name: task_name.into(),
            id: id.into(),
            data,
        }
    }

    /// `task_name/id` string used in log statements.
    pub fn task_and_instance(&self) -> String {
        format!("{}/{}", self.task_name, self.id)
    }
}

/// Durable record of one due or scheduled run of a task instance.
///
/// `picked` may go `false -> true` only through a successful atomic claim
/// in the store, and `true -> false` only through completion, reschedule,
/// removal or dead-execution revival. `version` increments on every
/// successful claim and serves as the optimistic-concurrency guard: a
/// claim that does not observe the expected `(picked, version)` state
/// matches zero rows and simply lost the race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub task_instance: TaskInstance,
    pub execution_time: DateTime<Utc>,
    pub picked: bool,
    pub picked_by: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub version: i64,
    pub consecutive_failures: i32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl Execution {
    /// A fresh, unpicked execution due at `execution_time`.
    pub fn new(task_instance: TaskInstance, execution_time: DateTime<Utc>) -> Self {
        Self {
            task_instance,
            execution_time,
            picked: false,
            picked_by: None,
            last_heartbeat: None,
            version: 1,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
        }
    }

    /// Identity key of the underlying task instance.
    pub fn identity(&self) -> (&str, &str) {
        (&self.task_instance.task_name, &self.task_instance.id)
    }
}

/// How one execution attempt ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success,
    Failure { cause: anyhow::Error },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success)
    }
}

/// The completion event for one execution attempt.
///
/// Produced exactly once per attempt, by the blocking and asynchronous
/// pipelines alike with identical field semantics, and consumed by
/// exactly one policy-handler call.
#[derive(Debug)]
pub struct ExecutionComplete {
    pub execution: Execution,
    pub time_started: DateTime<Utc>,
    pub time_done: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
}

impl ExecutionComplete {
    pub fn success(
        execution: Execution,
        time_started: DateTime<Utc>,
        time_done: DateTime<Utc>,
    ) -> Self {
        Self {
            execution,
            time_started,
            time_done,
            outcome: ExecutionOutcome::Success,
        }
    }

    pub fn failure(
        execution: Execution,
        time_started: DateTime<Utc>,
        time_done: DateTime<Utc>,
        cause: anyhow::Error,
    ) -> Self {
        Self {
            execution,
            time_started,
            time_done,
            outcome: ExecutionOutcome::Failure { cause },
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.time_done - self.time_started
    }
}

/// An execution currently running in this process.
///
/// Registered in the admission controller for the duration of one attempt;
/// the heartbeat loop and graceful shutdown read the registry. The entry is
/// removed unconditionally when the attempt finishes, whatever the outcome.
#[derive(Debug, Clone)]
pub struct CurrentlyExecuting {
    pub execution: Execution,
    pub started_at: DateTime<Utc>,
}

/// Store operations available to policy handlers for a single execution.
///
/// Wraps the store and the picked execution so handlers can only affect the
/// row they were invoked for.
pub struct ExecutionOperations {
    store: Arc<dyn ExecutionStore>,
    listeners: Arc<ListenerRegistry>,
    execution: Execution,
}

impl ExecutionOperations {
    pub(crate) fn new(
        store: Arc<dyn ExecutionStore>,
        listeners: Arc<ListenerRegistry>,
        execution: Execution,
    ) -> Self {
        Self {
            store,
            listeners,
            execution,
        }
    }

    /// The execution these operations are bound to.
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Delete the execution row. Terminal state for one-time tasks.
    pub async fn remove(&self) -> Result<(), HandlerError> {
        self.store.remove(&self.execution).await?;
        Ok(())
    }

    /// Write the execution back as unpicked and due at `next_time`,
    /// updating the failure bookkeeping from the attempt's outcome.
    ///
    /// A successful attempt resets `consecutive_failures` and stamps
    /// `last_success`; a failed attempt increments `consecutive_failures`
    /// and stamps `last_failure`. When `new_data` is `Some`, the payload is
    /// replaced wholesale.
    pub async fn reschedule(
        &self,
        complete: &ExecutionComplete,
        next_time: DateTime<Utc>,
        new_data: Option<Value>,
    ) -> Result<(), HandlerError> {
        let (last_success, last_failure, consecutive_failures) = match complete.outcome {
            ExecutionOutcome::Success => (Some(complete.time_done), self.execution.last_failure, 0),
            ExecutionOutcome::Failure { .. } => (
                self.execution.last_success,
                Some(complete.time_done),
                self.execution.consecutive_failures + 1,
            ),
        };

        self.store
            .reschedule(
                &self.execution,
                next_time,
                new_data,
                last_success,
                last_failure,
                consecutive_failures,
            )
            .await?;

        self.listeners
            .on_execution_scheduled(&self.execution.task_instance, next_time);
        Ok(())
    }

    /// Clear the pick and make the execution due at `now`, preserving the
    /// failure bookkeeping. Used by dead-execution handlers to return an
    /// orphaned row to the candidate pool.
    pub async fn revive(&self, now: DateTime<Utc>) -> Result<(), HandlerError> {
        self.store
            .reschedule(
                &self.execution,
                now,
                None,
                self.execution.last_success,
                self.execution.last_failure,
                self.execution.consecutive_failures,
            )
            .await?;

        self.listeners
            .on_execution_scheduled(&self.execution.task_instance, now);
        Ok(())
    }
}
