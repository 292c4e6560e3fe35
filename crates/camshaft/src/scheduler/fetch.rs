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

//! Polling and batch engine.
//!
//! Each tick fetches up to the derived upper limit of due candidates, tags
//! them with a generation-numbered batch, and runs every candidate through
//! an explicit per-candidate chain on the shared worker pool:
//!
//! admit (in-queue counter) → pool slot → shutdown check → staleness check
//! → atomic claim → resolve → dispatch to a pipeline → bookkeeping.
//!
//! Admission accounting always precedes the claim, and bookkeeping always
//! runs, whatever the outcome. A batch superseded by a newer generation is
//! evidence the pool is backlogged; its remaining candidates are abandoned
//! without store round-trips, which is an optimization only: the store's
//! atomic claim alone preserves correctness.
//!
//! Stores that support it are driven through the combined lock-and-fetch
//! fast path instead, with the fetch budget derived from current admission
//! pressure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use super::batch::DueExecutionsBatch;
use super::state::SchedulerState;
use crate::clock::Clock;
use crate::events::{CandidateEvent, ListenerRegistry, SchedulerEvent};
use crate::execution::Execution;
use crate::executor::pipeline::ExecutionPipeline;
use crate::executor::Executor;
use crate::store::ExecutionStore;
use crate::task::{TaskResolver, TaskRun};

pub(crate) struct DuePoller {
    store: Arc<dyn ExecutionStore>,
    resolver: Arc<TaskResolver>,
    executor: Arc<Executor>,
    pipeline: ExecutionPipeline,
    state: Arc<SchedulerState>,
    listeners: Arc<ListenerRegistry>,
    clock: Arc<dyn Clock>,
    scheduler_name: String,
    lower_limit: usize,
    upper_limit: usize,
    current_generation: AtomicU64,
    due_notify: Arc<Notify>,
}

impl DuePoller {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn ExecutionStore>,
        resolver: Arc<TaskResolver>,
        executor: Arc<Executor>,
        pipeline: ExecutionPipeline,
        state: Arc<SchedulerState>,
        listeners: Arc<ListenerRegistry>,
        clock: Arc<dyn Clock>,
        scheduler_name: String,
        lower_limit: usize,
        upper_limit: usize,
        due_notify: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            resolver,
            executor,
            pipeline,
            state,
            listeners,
            clock,
            scheduler_name,
            lower_limit,
            upper_limit,
            current_generation: AtomicU64::new(0),
            due_notify,
        }
    }

    /// One poll cycle: fetch due candidates and dispatch them.
    pub(crate) async fn execute_due(this: &Arc<Self>) {
        let now = this.clock.now();

        // Fast path for stores that can claim in the fetch round-trip.
        // The budget adapts to admission pressure so claimed rows never
        // pile up in memory.
        let budget = this
            .upper_limit
            .saturating_sub(this.executor.number_in_queue_or_processing());
        match this
            .store
            .lock_and_fetch(now, budget, &this.scheduler_name)
            .await
        {
            Ok(Some(picked)) => {
                trace!(count = picked.len(), "Locked and fetched due executions");
                for execution in picked {
                    let poller = Arc::clone(this);
                    this.executor
                        .submit(async move { poller.process_locked(execution).await })
                        .await;
                }
                this.listeners
                    .on_scheduler_event(SchedulerEvent::RanExecuteDue);
                return;
            }
            Ok(None) => {} // store has no fast path; fetch then claim
            Err(e) => {
                error!(error = %e, "Failed to lock-and-fetch due executions");
                this.listeners
                    .on_scheduler_event(SchedulerEvent::UnexpectedError);
                return;
            }
        }

        // Fetch a new candidate page. Candidates from older fetches still
        // queued behind the pool will become stale and be discarded.
        let fetched = match this.store.get_due(now, this.upper_limit).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(error = %e, "Failed to fetch due executions");
                this.listeners
                    .on_scheduler_event(SchedulerEvent::UnexpectedError);
                return;
            }
        };
        trace!(
            count = fetched.len(),
            at = %now,
            "Fetched due executions"
        );

        let generation = this.current_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let batch = Arc::new(DueExecutionsBatch::new(
            generation,
            fetched.len(),
            fetched.len() == this.upper_limit,
            this.lower_limit,
        ));

        for candidate in fetched {
            let poller = Arc::clone(this);
            let batch = Arc::clone(&batch);
            this.executor
                .submit(async move { poller.process_candidate(batch, candidate).await })
                .await;
        }

        this.listeners
            .on_scheduler_event(SchedulerEvent::RanExecuteDue);
    }

    /// The explicit sequential chain for one fetched candidate.
    async fn process_candidate(self: Arc<Self>, batch: Arc<DueExecutionsBatch>, candidate: Execution) {
        self.executor.increment_in_queue();
        self.pick_and_execute(&batch, candidate).await;
        self.executor.decrement_in_queue();
        batch.one_execution_done(|| {
            debug!("Batch low on candidates, triggering early check for due executions");
            self.due_notify.notify_one();
        });
    }

    async fn pick_and_execute(&self, batch: &DueExecutionsBatch, candidate: Execution) {
        // Claim and body both run under one pool slot, so polling cannot
        // outrun processing capacity.
        let _permit = match self.executor.acquire_slot().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Worker pool closed, dropping fetched due execution");
                return;
            }
        };

        if self.state.is_shutting_down() {
            info!(
                execution = %candidate.task_instance.task_and_instance(),
                "Scheduler has been shut down, skipping fetched due execution"
            );
            return;
        }

        let current = self.current_generation.load(Ordering::SeqCst);
        if batch.is_stale() || batch.is_older_generation_than(current) {
            batch.mark_stale();
            self.listeners.on_candidate_event(CandidateEvent::Stale);
            trace!(
                batch_generation = batch.generation_number(),
                current_generation = current,
                "Skipping queued execution from a superseded batch"
            );
            return;
        }

        let picked = match self
            .store
            .claim(&candidate, self.clock.now(), &self.scheduler_name)
            .await
        {
            Ok(Some(picked)) => picked,
            Ok(None) => {
                debug!(
                    execution = %candidate.task_instance.task_and_instance(),
                    "Execution picked by another scheduler, continuing to next due execution"
                );
                self.listeners
                    .on_candidate_event(CandidateEvent::AlreadyPicked);
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to claim due execution");
                self.listeners
                    .on_scheduler_event(SchedulerEvent::UnexpectedError);
                return;
            }
        };

        self.listeners.on_candidate_event(CandidateEvent::Executed);
        self.dispatch(picked).await;
    }

    /// An execution the store already claimed for us on the fast path.
    /// It must run even under backpressure, since abandoning it would leave
    /// the row locked until the dead-execution sweep.
    async fn process_locked(self: Arc<Self>, picked: Execution) {
        self.executor.increment_in_queue();
        match self.executor.acquire_slot().await {
            Ok(_permit) => {
                self.listeners.on_candidate_event(CandidateEvent::Executed);
                self.dispatch(picked).await;
            }
            Err(_) => {
                info!(
                    execution = %picked.task_instance.task_and_instance(),
                    "Worker pool closed while holding a locked execution; it will be \
                     recovered by the dead-execution sweep"
                );
            }
        }
        self.executor.decrement_in_queue();
    }

    async fn dispatch(&self, picked: Execution) {
        let Some(task) = self.resolver.resolve(&picked.task_instance.task_name) else {
            error!(
                task = %picked.task_instance.task_name,
                "Failed to find implementation for task. Executions with unknown task \
                 names should have been filtered out before dispatch."
            );
            self.listeners
                .on_scheduler_event(SchedulerEvent::UnexpectedError);
            return;
        };

        match task.run() {
            TaskRun::Async(_) => {
                self.pipeline
                    .execute_picked_async(&self.executor, task, picked)
                    .await
            }
            TaskRun::Blocking(_) => {
                self.pipeline
                    .execute_picked(&self.executor, task, picked)
                    .await
            }
        }
    }
}
