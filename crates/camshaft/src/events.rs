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

//! Scheduler observability contract.
//!
//! [`SchedulerListener`] is the sole extension point for metrics and
//! tracing: the scheduler calls it at the documented points but owns no
//! sink. Every method has a no-op default so implementations override only
//! what they care about.
//!
//! Two in-crate listeners are provided: [`StatsCounters`], which keeps
//! plain atomic counters (useful in tests and for cheap introspection),
//! and [`MetricsListener`], which forwards events to the `metrics` facade
//! for whatever recorder the embedding application installs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::execution::{CurrentlyExecuting, Execution, ExecutionComplete, TaskInstance};

/// Scheduler-level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerEvent {
    /// One execute-due poll cycle ran to completion.
    RanExecuteDue,
    /// An unexpected internal error was contained (store I/O failure,
    /// unresolvable task, violated dispatch invariant).
    UnexpectedError,
    /// A completion handler raised an error; the execution stays picked.
    CompletionHandlerError,
    /// A failure handler raised an error; the execution stays picked.
    FailureHandlerError,
}

/// Per-candidate events emitted while processing a due batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateEvent {
    /// The candidate was claimed by this process and dispatched.
    Executed,
    /// The candidate was abandoned because its batch was superseded by a
    /// newer poll generation.
    Stale,
    /// Another process won the claim race for this candidate.
    AlreadyPicked,
}

/// Callbacks invoked by the scheduler at well-defined points.
///
/// Implementations must be cheap and non-blocking; they run inline on
/// worker-pool tasks.
pub trait SchedulerListener: Send + Sync {
    fn on_execution_scheduled(&self, _instance: &TaskInstance, _execution_time: DateTime<Utc>) {}

    fn on_execution_start(&self, _currently_executing: &CurrentlyExecuting) {}

    fn on_execution_complete(&self, _complete: &ExecutionComplete) {}

    fn on_execution_dead(&self, _execution: &Execution) {}

    fn on_execution_failed_heartbeat(&self, _currently_executing: &CurrentlyExecuting) {}

    fn on_scheduler_event(&self, _event: SchedulerEvent) {}

    fn on_candidate_event(&self, _event: CandidateEvent) {}
}

/// Fan-out over all registered listeners.
///
/// Built during scheduler construction, immutable afterwards, so there is
/// no locking on the hot path.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn SchedulerListener>>,
}

impl ListenerRegistry {
    pub(crate) fn new(listeners: Vec<Arc<dyn SchedulerListener>>) -> Self {
        Self { listeners }
    }

    pub(crate) fn on_execution_scheduled(
        &self,
        instance: &TaskInstance,
        execution_time: DateTime<Utc>,
    ) {
        for listener in &self.listeners {
            listener.on_execution_scheduled(instance, execution_time);
        }
    }

    pub(crate) fn on_execution_start(&self, currently_executing: &CurrentlyExecuting) {
        for listener in &self.listeners {
            listener.on_execution_start(currently_executing);
        }
    }

    pub(crate) fn on_execution_complete(&self, complete: &ExecutionComplete) {
        for listener in &self.listeners {
            listener.on_execution_complete(complete);
        }
    }

    pub(crate) fn on_execution_dead(&self, execution: &Execution) {
        for listener in &self.listeners {
            listener.on_execution_dead(execution);
        }
    }

    pub(crate) fn on_execution_failed_heartbeat(&self, currently_executing: &CurrentlyExecuting) {
        for listener in &self.listeners {
            listener.on_execution_failed_heartbeat(currently_executing);
        }
    }

    pub(crate) fn on_scheduler_event(&self, event: SchedulerEvent) {
        for listener in &self.listeners {
            listener.on_scheduler_event(event);
        }
    }

    pub(crate) fn on_candidate_event(&self, event: CandidateEvent) {
        for listener in &self.listeners {
            listener.on_candidate_event(event);
        }
    }
}

/// Atomic event counters.
#[derive(Debug, Default)]
pub struct StatsCounters {
    ran_execute_due: AtomicU64,
    unexpected_errors: AtomicU64,
    completion_handler_errors: AtomicU64,
    failure_handler_errors: AtomicU64,
    candidates_executed: AtomicU64,
    candidates_stale: AtomicU64,
    candidates_already_picked: AtomicU64,
    executions_completed: AtomicU64,
    executions_failed: AtomicU64,
    executions_dead: AtomicU64,
    failed_heartbeats: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ran_execute_due(&self) -> u64 {
        self.ran_execute_due.load(Ordering::Relaxed)
    }

    pub fn unexpected_errors(&self) -> u64 {
        self.unexpected_errors.load(Ordering::Relaxed)
    }

    pub fn completion_handler_errors(&self) -> u64 {
        self.completion_handler_errors.load(Ordering::Relaxed)
    }

    pub fn failure_handler_errors(&self) -> u64 {
        self.failure_handler_errors.load(Ordering::Relaxed)
    }

    pub fn candidates_executed(&self) -> u64 {
        self.candidates_executed.load(Ordering::Relaxed)
    }

    pub fn candidates_stale(&self) -> u64 {
        self.candidates_stale.load(Ordering::Relaxed)
    }

    pub fn candidates_already_picked(&self) -> u64 {
        self.candidates_already_picked.load(Ordering::Relaxed)
    }

    pub fn executions_completed(&self) -> u64 {
        self.executions_completed.load(Ordering::Relaxed)
    }

    pub fn executions_failed(&self) -> u64 {
        self.executions_failed.load(Ordering::Relaxed)
    }

    pub fn executions_dead(&self) -> u64 {
        self.executions_dead.load(Ordering::Relaxed)
    }

    pub fn failed_heartbeats(&self) -> u64 {
        self.failed_heartbeats.load(Ordering::Relaxed)
    }
}

impl SchedulerListener for StatsCounters {
    fn on_execution_complete(&self, complete: &ExecutionComplete) {
        if complete.is_success() {
            self.executions_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.executions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_execution_dead(&self, _execution: &Execution) {
        self.executions_dead.fetch_add(1, Ordering::Relaxed);
    }

    fn on_execution_failed_heartbeat(&self, _currently_executing: &CurrentlyExecuting) {
        self.failed_heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    fn on_scheduler_event(&self, event: SchedulerEvent) {
        let counter = match event {
            SchedulerEvent::RanExecuteDue => &self.ran_execute_due,
            SchedulerEvent::UnexpectedError => &self.unexpected_errors,
            SchedulerEvent::CompletionHandlerError => &self.completion_handler_errors,
            SchedulerEvent::FailureHandlerError => &self.failure_handler_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_candidate_event(&self, event: CandidateEvent) {
        let counter = match event {
            CandidateEvent::Executed => &self.candidates_executed,
            CandidateEvent::Stale => &self.candidates_stale,
            CandidateEvent::AlreadyPicked => &self.candidates_already_picked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards scheduler events to the `metrics` facade.
///
/// The crate never installs a recorder; wiring a sink (Prometheus,
/// statsd, ...) is the embedding application's job.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsListener;

impl SchedulerListener for MetricsListener {
    fn on_execution_complete(&self, complete: &ExecutionComplete) {
        let result = if complete.is_success() {
            "completed"
        } else {
            "failed"
        };
        metrics::counter!("camshaft_executions_total", "result" => result).increment(1);
        if let Ok(duration) = complete.duration().to_std() {
            metrics::histogram!("camshaft_execution_duration_seconds")
                .record(duration.as_secs_f64());
        }
    }

    fn on_execution_dead(&self, _execution: &Execution) {
        metrics::counter!("camshaft_dead_executions_total").increment(1);
    }

    fn on_execution_failed_heartbeat(&self, _currently_executing: &CurrentlyExecuting) {
        metrics::counter!("camshaft_failed_heartbeats_total").increment(1);
    }

    fn on_scheduler_event(&self, event: SchedulerEvent) {
        let kind = match event {
            SchedulerEvent::RanExecuteDue => "ran_execute_due",
            SchedulerEvent::UnexpectedError => "unexpected_error",
            SchedulerEvent::CompletionHandlerError => "completion_handler_error",
            SchedulerEvent::FailureHandlerError => "failure_handler_error",
        };
        metrics::counter!("camshaft_scheduler_events_total", "event" => kind).increment(1);
    }

    fn on_candidate_event(&self, event: CandidateEvent) {
        let kind = match event {
            CandidateEvent::Executed => "executed",
            CandidateEvent::Stale => "stale",
            CandidateEvent::AlreadyPicked => "already_picked",
        };
        metrics::counter!("camshaft_candidates_total", "event" => kind).increment(1);
    }
}
