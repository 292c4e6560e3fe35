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

//! Error types for the camshaft scheduler.
//!
//! Errors are split per concern: [`StoreError`] for the execution store
//! contract, [`ScheduleError`] for next-run computation, [`HandlerError`]
//! for completion/failure/dead-execution policy handlers, and
//! [`SchedulerError`] for the scheduler facade itself.
//!
//! Two outcomes are deliberately *not* errors anywhere in this crate:
//! a claim attempt that loses the race (another process picked the
//! execution first) and a task-name lookup that finds nothing. Both are
//! modeled as `Option`.

use thiserror::Error;

/// Errors raised by an [`ExecutionStore`](crate::store::ExecutionStore)
/// implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend failed (connection loss, constraint violation,
    /// unexpected row state). The polling loop logs these and keeps ticking.
    #[error("execution store backend error: {0}")]
    Backend(String),

    /// Task payload could not be serialized or deserialized.
    #[error("task data serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors computing the next execution time from a [`Schedule`](crate::task::Schedule).
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("cron expression '{expression}' has no upcoming occurrence")]
    NoUpcomingOccurrence { expression: String },

    #[error("daily schedule has no times configured")]
    EmptyDaily,
}

/// Errors raised while applying a completion, failure or dead-execution
/// policy to the store.
///
/// These are caught at the pipeline boundary: the execution is left picked
/// and the dead-execution sweep is its only path back to a runnable state.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The task's persisted data did not contain what the handler needed
    /// (e.g. a self-describing schedule that fails to deserialize).
    #[error("task data did not satisfy handler requirements: {0}")]
    InvalidTaskData(String),

    #[error("handler failed: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the [`Scheduler`](crate::scheduler::Scheduler) facade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `start()` was called on a scheduler that is not in the created state.
    #[error("scheduler has already been started")]
    AlreadyStarted,

    /// Two registered tasks share a name. Task names must be unique since
    /// they key execution rows back to their implementation.
    #[error("duplicate task name: '{0}'")]
    DuplicateTask(String),

    /// A scheduler was built without any registered tasks.
    #[error("no tasks registered")]
    NoTasks,

    #[error(transparent)]
    Store(#[from] StoreError),
}
