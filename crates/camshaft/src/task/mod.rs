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

//! Task definitions and resolution.
//!
//! A [`Task`] is an immutable configuration value: a name, an execution
//! body (blocking or asynchronous), a failure policy and a dead-execution
//! policy. Tasks are registered once at scheduler construction and resolved
//! by name when an execution row is claimed. There is no runtime
//! subclassing; composing a task is plain function calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use camshaft::task::{Task, Completion};
//! use camshaft::task::handlers::RetryLater;
//! use std::time::Duration;
//!
//! let send_welcome_email = Task::blocking("send-welcome-email", |instance, _ctx| {
//!     deliver(&instance.data)?;
//!     Ok(Completion::Remove)
//! })
//! .with_failure_handler(RetryLater::new(Duration::from_secs(300)));
//! ```

pub mod handlers;
pub mod schedule;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SchedulerError;
use crate::execution::{Execution, TaskInstance};
use crate::scheduler::state::SchedulerState;
use handlers::{Completion, DeadExecutionHandler, FailureHandler, RetryLater, ReviveDeadExecution};

/// Per-attempt context handed to task bodies.
///
/// Carries the claimed execution, the owning scheduler's identity and a
/// read-only view of the lifecycle state so long-running bodies can check
/// `is_shutting_down()` and wind down cooperatively.
#[derive(Clone)]
pub struct ExecutionContext {
    execution: Execution,
    scheduler_name: String,
    state: Arc<SchedulerState>,
}

impl ExecutionContext {
    pub(crate) fn new(
        execution: Execution,
        scheduler_name: String,
        state: Arc<SchedulerState>,
    ) -> Self {
        Self {
            execution,
            scheduler_name,
            state,
        }
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn scheduler_name(&self) -> &str {
        &self.scheduler_name
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.is_shutting_down()
    }
}

/// A blocking task body.
///
/// Runs on a blocking worker while holding one worker-pool slot for its
/// full duration; there is no preemption or timeout. Return the
/// [`Completion`] describing the execution's next durable state, or any
/// error to route the attempt to the task's failure handler.
pub trait ExecutionHandler: Send + Sync + 'static {
    fn execute(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> Result<Completion, anyhow::Error>;
}

impl<F> ExecutionHandler for F
where
    F: Fn(&TaskInstance, &ExecutionContext) -> Result<Completion, anyhow::Error>
        + Send
        + Sync
        + 'static,
{
    fn execute(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> Result<Completion, anyhow::Error> {
        self(instance, ctx)
    }
}

/// An asynchronous task body.
///
/// Returns control to the pool at every await point; the completion
/// continuation is re-enqueued onto the same shared pool.
#[async_trait]
pub trait AsyncExecutionHandler: Send + Sync + 'static {
    async fn execute_async(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> Result<Completion, anyhow::Error>;
}

/// The execution body of a task, tagged by pipeline.
#[derive(Clone)]
pub enum TaskRun {
    /// Dispatched through the blocking pipeline.
    Blocking(Arc<dyn ExecutionHandler>),
    /// Dispatched through the asynchronous pipeline.
    Async(Arc<dyn AsyncExecutionHandler>),
}

impl TaskRun {
    pub fn is_async(&self) -> bool {
        matches!(self, TaskRun::Async(_))
    }
}

impl fmt::Debug for TaskRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRun::Blocking(_) => f.write_str("TaskRun::Blocking"),
            TaskRun::Async(_) => f.write_str("TaskRun::Async"),
        }
    }
}

/// Immutable task configuration: name, body, failure policy and
/// dead-execution policy.
///
/// Defaults: failures retry after five minutes, dead executions are
/// revived. Override with [`Task::with_failure_handler`] and
/// [`Task::with_dead_execution_handler`].
#[derive(Clone)]
pub struct Task {
    name: String,
    run: TaskRun,
    on_failure: Arc<dyn FailureHandler>,
    on_dead: Arc<dyn DeadExecutionHandler>,
}

impl Task {
    /// A task with a blocking body.
    pub fn blocking(name: impl Into<String>, handler: impl ExecutionHandler) -> Self {
        Self::new(name, TaskRun::Blocking(Arc::new(handler)))
    }

    /// A task with an asynchronous body.
    pub fn asynchronous(name: impl Into<String>, handler: impl AsyncExecutionHandler) -> Self {
        Self::new(name, TaskRun::Async(Arc::new(handler)))
    }

    fn new(name: impl Into<String>, run: TaskRun) -> Self {
        Self {
            name: name.into(),
            run,
            on_failure: Arc::new(RetryLater::new(Duration::from_secs(300))),
            on_dead: Arc::new(ReviveDeadExecution),
        }
    }

    pub fn with_failure_handler(mut self, handler: impl FailureHandler + 'static) -> Self {
        self.on_failure = Arc::new(handler);
        self
    }

    pub fn with_dead_execution_handler(
        mut self,
        handler: impl DeadExecutionHandler + 'static,
    ) -> Self {
        self.on_dead = Arc::new(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self) -> &TaskRun {
        &self.run
    }

    pub fn failure_handler(&self) -> &Arc<dyn FailureHandler> {
        &self.on_failure
    }

    pub fn dead_execution_handler(&self) -> &Arc<dyn DeadExecutionHandler> {
        &self.on_dead
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("run", &self.run)
            .finish()
    }
}

/// Name-to-task index.
///
/// Built once during scheduler construction, immutable at runtime. A miss
/// is an `Option::None`, not an error; executions for unknown task names
/// can legitimately exist in a store shared with newer nodes.
pub struct TaskResolver {
    tasks: HashMap<String, Task>,
}

impl TaskResolver {
    pub fn new(tasks: Vec<Task>) -> Result<Self, SchedulerError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if index.contains_key(task.name()) {
                return Err(SchedulerError::DuplicateTask(task.name().to_string()));
            }
            index.insert(task.name().to_string(), task);
        }
        Ok(Self { tasks: index })
    }

    pub fn resolve(&self, task_name: &str) -> Option<&Task> {
        self.tasks.get(task_name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
