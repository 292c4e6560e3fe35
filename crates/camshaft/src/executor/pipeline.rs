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

//! Execution pipelines.
//!
//! Once a candidate has been claimed and its task resolved, one of two
//! pipelines runs the attempt: [`ExecutionPipeline::execute_picked`] for
//! blocking bodies, [`ExecutionPipeline::execute_picked_async`] for
//! asynchronous ones. Both produce an externally identical
//! [`ExecutionComplete`] and route it to the completion outcome (success)
//! or the task's failure handler (failure), so policy handlers never need
//! to know which pipeline ran.
//!
//! Handler errors are contained here: the execution is left picked and
//! recovery is deferred to the dead-execution sweep. Nothing in this module
//! propagates an error out of an attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use super::Executor;
use crate::clock::Clock;
use crate::events::{ListenerRegistry, SchedulerEvent};
use crate::execution::{CurrentlyExecuting, Execution, ExecutionComplete, ExecutionOperations};
use crate::scheduler::state::SchedulerState;
use crate::store::ExecutionStore;
use crate::task::handlers::Completion;
use crate::task::{ExecutionContext, Task, TaskRun};

pub(crate) struct ExecutionPipeline {
    store: Arc<dyn ExecutionStore>,
    listeners: Arc<ListenerRegistry>,
    state: Arc<SchedulerState>,
    clock: Arc<dyn Clock>,
    scheduler_name: String,
}

impl ExecutionPipeline {
    pub(crate) fn new(
        store: Arc<dyn ExecutionStore>,
        listeners: Arc<ListenerRegistry>,
        state: Arc<SchedulerState>,
        clock: Arc<dyn Clock>,
        scheduler_name: String,
    ) -> Self {
        Self {
            store,
            listeners,
            state,
            clock,
            scheduler_name,
        }
    }

    /// Run a claimed execution with a blocking task body.
    ///
    /// The body runs on a blocking worker while the caller keeps holding
    /// its pool permit, so a hung body degrades pool capacity for its full
    /// duration. There is no preemption or timeout here.
    pub(crate) async fn execute_picked(&self, executor: &Executor, task: &Task, picked: Execution) {
        let started = self.clock.now();
        let execution_id = self.register(executor, &picked, started);

        let TaskRun::Blocking(handler) = task.run() else {
            self.dispatch_invariant_violated(task, &picked, "blocking");
            executor.remove_currently_executing(&execution_id);
            return;
        };

        debug!(
            execution = %picked.task_instance.task_and_instance(),
            "Executing"
        );

        let handler = handler.clone();
        let instance = picked.task_instance.clone();
        let ctx = ExecutionContext::new(
            picked.clone(),
            self.scheduler_name.clone(),
            self.state.clone(),
        );
        let result = match tokio::task::spawn_blocking(move || handler.execute(&instance, &ctx)).await
        {
            Ok(result) => result,
            Err(join_error) => Err(anyhow::anyhow!("task body panicked: {join_error}")),
        };

        self.route_completion(task, picked, started, result).await;
        executor.remove_currently_executing(&execution_id);
    }

    /// Run a claimed execution with an asynchronous task body.
    ///
    /// The completion continuation is re-enqueued onto the same shared
    /// pool as everything else; async work gets no separate budget.
    pub(crate) async fn execute_picked_async(
        &self,
        executor: &Executor,
        task: &Task,
        picked: Execution,
    ) {
        let started = self.clock.now();
        let execution_id = self.register(executor, &picked, started);

        let TaskRun::Async(handler) = task.run() else {
            self.dispatch_invariant_violated(task, &picked, "asynchronous");
            executor.remove_currently_executing(&execution_id);
            return;
        };

        debug!(
            execution = %picked.task_instance.task_and_instance(),
            "Executing async"
        );

        let handler = handler.clone();
        let instance = picked.task_instance.clone();
        let ctx = ExecutionContext::new(
            picked.clone(),
            self.scheduler_name.clone(),
            self.state.clone(),
        );
        let body = tokio::spawn(async move { handler.execute_async(&instance, &ctx).await });
        let result = match body.await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow::anyhow!("async task body panicked: {join_error}")),
        };

        self.route_completion(task, picked, started, result).await;
        executor.remove_currently_executing(&execution_id);
    }

    fn register(&self, executor: &Executor, picked: &Execution, started: DateTime<Utc>) -> uuid::Uuid {
        let entry = CurrentlyExecuting {
            execution: picked.clone(),
            started_at: started,
        };
        let id = executor.add_currently_executing(entry.clone());
        self.listeners.on_execution_start(&entry);
        id
    }

    /// The dispatch decision is supposed to guarantee the pipeline matches
    /// the task's declared execution mode; a mismatch is an internal
    /// consistency violation. It is fatal to this one attempt only: the
    /// execution stays picked and the dead-execution sweep will recover it.
    fn dispatch_invariant_violated(&self, task: &Task, picked: &Execution, expected: &str) {
        error!(
            task = task.name(),
            execution = %picked.task_instance.task_and_instance(),
            "Task was dispatched to the {expected} pipeline but its body does not support it. \
             Aborting this attempt; the execution remains picked."
        );
        self.listeners
            .on_scheduler_event(SchedulerEvent::UnexpectedError);
    }

    async fn route_completion(
        &self,
        task: &Task,
        picked: Execution,
        started: DateTime<Utc>,
        result: Result<Completion, anyhow::Error>,
    ) {
        let done = self.clock.now();

        match result {
            Ok(completion) => {
                let complete = ExecutionComplete::success(picked, started, done);
                let ops = ExecutionOperations::new(
                    self.store.clone(),
                    self.listeners.clone(),
                    complete.execution.clone(),
                );
                if let Err(e) = completion.apply(&complete, &ops).await {
                    self.listeners
                        .on_scheduler_event(SchedulerEvent::CompletionHandlerError);
                    self.listeners
                        .on_scheduler_event(SchedulerEvent::UnexpectedError);
                    self.log_handler_failure(&complete.execution, &e);
                }
                self.listeners.on_execution_complete(&complete);
            }
            Err(cause) => {
                warn!(
                    execution = %picked.task_instance.task_and_instance(),
                    error = %cause,
                    "Execution failed, treating as failure"
                );
                let complete = ExecutionComplete::failure(picked, started, done, cause);
                let ops = ExecutionOperations::new(
                    self.store.clone(),
                    self.listeners.clone(),
                    complete.execution.clone(),
                );
                if let Err(e) = task.failure_handler().on_failure(&complete, &ops).await {
                    self.listeners
                        .on_scheduler_event(SchedulerEvent::FailureHandlerError);
                    self.listeners
                        .on_scheduler_event(SchedulerEvent::UnexpectedError);
                    self.log_handler_failure(&complete.execution, &e);
                }
                self.listeners.on_execution_complete(&complete);
            }
        }
    }

    fn log_handler_failure(&self, execution: &Execution, error: &crate::error::HandlerError) {
        error!(
            execution = %execution.task_instance.task_and_instance(),
            error = %error,
            "Failed while completing execution. The execution will remain locked and picked \
             until it is detected as dead, and then be handled by the task's dead-execution \
             handler."
        );
    }
}
