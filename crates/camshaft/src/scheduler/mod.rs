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

//! Scheduler facade and background services.
//!
//! A [`Scheduler`] wires the polling engine, the admission-controlled
//! worker pool and the housekeeping loops (heartbeats and the
//! dead-execution sweep) around an [`ExecutionStore`]. Many scheduler
//! processes may share one store; the store's atomic claim keeps them from
//! executing the same row twice.
//!
//! # Example
//!
//! ```rust,ignore
//! let scheduler = Scheduler::builder(store)
//!     .task(my_task)
//!     .config(SchedulerConfig::new("node-1"))
//!     .build()?;
//!
//! scheduler.start().await?;
//! scheduler.schedule(instance, Utc::now()).await?;
//! // ...
//! scheduler.stop().await;
//! ```

pub(crate) mod batch;
pub(crate) mod fetch;
pub mod state;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::events::{ListenerRegistry, SchedulerEvent, SchedulerListener};
use crate::execution::{CurrentlyExecuting, Execution, ExecutionOperations, TaskInstance};
use crate::executor::pipeline::ExecutionPipeline;
use crate::executor::Executor;
use crate::store::ExecutionStore;
use crate::task::{Task, TaskResolver};
use fetch::DuePoller;
use state::{LifecyclePhase, SchedulerState};

/// A persistent task scheduler bound to one execution store.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn ExecutionStore>,
    state: Arc<SchedulerState>,
    listeners: Arc<ListenerRegistry>,
    executor: Arc<Executor>,
    poller: Arc<DuePoller>,
    housekeeper: Arc<Housekeeper>,
    due_notify: Arc<Notify>,
    handles: tokio::sync::Mutex<RuntimeHandles>,
}

/// Handles for the background loops, kept for graceful shutdown.
#[derive(Default)]
struct RuntimeHandles {
    loop_handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl Scheduler {
    /// Start building a scheduler on top of `store`.
    pub fn builder(store: Arc<dyn ExecutionStore>) -> SchedulerBuilder {
        SchedulerBuilder::new(store)
    }

    /// Transition to started and spawn the background services: the
    /// execute-due polling loop, the heartbeat loop and the dead-execution
    /// sweep.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if !self.state.advance_to(LifecyclePhase::Started) {
            return Err(SchedulerError::AlreadyStarted);
        }

        info!(
            scheduler = %self.config.scheduler_name,
            pool_size = self.config.worker_pool_size,
            "Starting scheduler"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = self.handles.lock().await;

        handles.loop_handles.push(tokio::spawn(Self::execute_due_loop(
            Arc::clone(&self.poller),
            Arc::clone(&self.state),
            Arc::clone(&self.due_notify),
            self.config.poll_interval,
            shutdown_rx.clone(),
        )));
        handles.loop_handles.push(tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&self.housekeeper),
            self.config.heartbeat_interval,
            shutdown_rx.clone(),
        )));
        handles.loop_handles.push(tokio::spawn(Self::dead_execution_loop(
            Arc::clone(&self.housekeeper),
            self.config.heartbeat_interval,
            shutdown_rx,
        )));
        handles.shutdown_tx = Some(shutdown_tx);

        Ok(())
    }

    /// Persist a new execution for `instance`, due at `execution_time`.
    ///
    /// Returns whether a row was created; an execution with the same
    /// identity already in the store is left untouched. When the due time
    /// has already passed, a started scheduler checks for due executions
    /// immediately instead of waiting for the next poll tick.
    pub async fn schedule(
        &self,
        instance: TaskInstance,
        execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let execution = Execution::new(instance, execution_time);
        let created = self.store.create_if_not_exists(&execution).await?;
        if created {
            debug!(
                execution = %execution.task_instance.task_and_instance(),
                execution_time = %execution_time,
                "Scheduled execution"
            );
            self.listeners
                .on_execution_scheduled(&execution.task_instance, execution_time);
        } else {
            debug!(
                execution = %execution.task_instance.task_and_instance(),
                "Execution already exists, not scheduling"
            );
        }
        Ok(created)
    }

    /// Run an out-of-cycle check for due executions.
    ///
    /// Overlapping triggers collapse into a single extra poll. Ignored
    /// unless the scheduler is started and not shutting down.
    pub fn trigger_check_for_due_executions(&self) {
        if !self.state.is_started() || self.state.is_shutting_down() {
            debug!("Ignoring check-for-due trigger, scheduler is starting or shutting down");
            return;
        }
        self.due_notify.notify_one();
    }

    /// Read-only lifecycle state.
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Snapshot of the executions this process is currently running.
    pub fn currently_executing(&self) -> Vec<CurrentlyExecuting> {
        self.executor.currently_executing()
    }

    /// Graceful shutdown: stop polling, abandon not-yet-claimed candidates,
    /// wait up to the configured grace period for in-flight executions,
    /// then abort the stragglers.
    pub async fn stop(&self) {
        if !self.state.advance_to(LifecyclePhase::ShuttingDown) {
            debug!("Multiple calls to stop, scheduler is already stopping");
            return;
        }
        info!(scheduler = %self.config.scheduler_name, "Shutting down scheduler");

        let mut handles = self.handles.lock().await;
        if let Some(shutdown_tx) = handles.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        for handle in handles.loop_handles.drain(..) {
            let _ = handle.await;
        }

        // Wake chains queued for a pool slot so they can observe shutdown,
        // then wait for in-flight work.
        self.executor.close();
        self.executor
            .join_ongoing(self.config.shutdown_max_wait)
            .await;

        self.state.advance_to(LifecyclePhase::Stopped);
        info!(scheduler = %self.config.scheduler_name, "Scheduler stopped");
    }

    async fn execute_due_loop(
        poller: Arc<DuePoller>,
        state: Arc<SchedulerState>,
        due_notify: Arc<Notify>,
        poll_interval: std::time::Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = due_notify.notified() => {
                    trace!("Woke from check-for-due trigger");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if state.is_shutting_down() {
                break;
            }
            DuePoller::execute_due(&poller).await;
        }
        debug!("Execute-due loop stopped");
    }

    async fn heartbeat_loop(
        housekeeper: Arc<Housekeeper>,
        heartbeat_interval: std::time::Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(heartbeat_interval);
        // The immediate first tick has nothing to heartbeat.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            housekeeper.update_heartbeats().await;
        }
        debug!("Heartbeat loop stopped");
    }

    async fn dead_execution_loop(
        housekeeper: Arc<Housekeeper>,
        heartbeat_interval: std::time::Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            housekeeper.detect_dead_executions().await;
        }
        debug!("Dead-execution loop stopped");
    }
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    store: Arc<dyn ExecutionStore>,
    tasks: Vec<Task>,
    config: SchedulerConfig,
    listeners: Vec<Arc<dyn SchedulerListener>>,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            tasks: Vec::new(),
            config: SchedulerConfig::default(),
            listeners: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Register one task type.
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Register several task types.
    pub fn tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an observability listener.
    pub fn listener(mut self, listener: Arc<dyn SchedulerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Replace the time source. Intended for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        if self.tasks.is_empty() {
            return Err(SchedulerError::NoTasks);
        }
        let resolver = Arc::new(TaskResolver::new(self.tasks)?);

        let state = Arc::new(SchedulerState::new());
        let due_notify = Arc::new(Notify::new());

        // A newly scheduled execution that is already due short-circuits
        // the poll timer.
        let mut listeners = self.listeners;
        listeners.push(Arc::new(ImmediateCheckForDue {
            state: Arc::clone(&state),
            due_notify: Arc::clone(&due_notify),
            clock: Arc::clone(&self.clock),
        }));
        let listeners = Arc::new(ListenerRegistry::new(listeners));

        let executor = Arc::new(Executor::new(self.config.worker_pool_size));
        let pipeline = ExecutionPipeline::new(
            Arc::clone(&self.store),
            Arc::clone(&listeners),
            Arc::clone(&state),
            Arc::clone(&self.clock),
            self.config.scheduler_name.clone(),
        );
        let poller = Arc::new(DuePoller::new(
            Arc::clone(&self.store),
            Arc::clone(&resolver),
            Arc::clone(&executor),
            pipeline,
            Arc::clone(&state),
            Arc::clone(&listeners),
            Arc::clone(&self.clock),
            self.config.scheduler_name.clone(),
            self.config.lower_limit(),
            self.config.upper_limit(),
            Arc::clone(&due_notify),
        ));
        let housekeeper = Arc::new(Housekeeper {
            store: Arc::clone(&self.store),
            resolver,
            executor: Arc::clone(&executor),
            listeners: Arc::clone(&listeners),
            clock: self.clock,
            config: self.config.clone(),
        });

        Ok(Scheduler {
            config: self.config,
            store: self.store,
            state,
            listeners,
            executor,
            poller,
            housekeeper,
            due_notify,
            handles: tokio::sync::Mutex::new(RuntimeHandles::default()),
        })
    }
}

/// Converts on-scheduled events for already-due executions into an
/// out-of-cycle poll, instead of waiting for the fixed interval.
struct ImmediateCheckForDue {
    state: Arc<SchedulerState>,
    due_notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl SchedulerListener for ImmediateCheckForDue {
    fn on_execution_scheduled(&self, instance: &TaskInstance, execution_time: DateTime<Utc>) {
        if !self.state.is_started() || self.state.is_shutting_down() {
            debug!(
                execution = %instance.task_and_instance(),
                "Not acting on scheduling event, scheduler is starting or shutting down"
            );
            return;
        }
        if execution_time <= self.clock.now() {
            debug!(
                execution = %instance.task_and_instance(),
                "Task instance is due immediately, triggering check for due executions"
            );
            self.due_notify.notify_one();
        }
    }
}

/// Heartbeat and dead-execution housekeeping shared by the background loops.
struct Housekeeper {
    store: Arc<dyn ExecutionStore>,
    resolver: Arc<TaskResolver>,
    executor: Arc<Executor>,
    listeners: Arc<ListenerRegistry>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Housekeeper {
    /// Refresh heartbeats for every in-flight execution.
    async fn update_heartbeats(&self) {
        let in_flight = self.executor.currently_executing();
        if in_flight.is_empty() {
            trace!("No executions to update heartbeats for");
            return;
        }

        debug!(count = in_flight.len(), "Updating heartbeats");
        let now = self.clock.now();
        for currently_executing in in_flight {
            if let Err(e) = self
                .store
                .update_heartbeat(&currently_executing.execution, now)
                .await
            {
                error!(
                    execution = %currently_executing.execution.task_instance.task_and_instance(),
                    error = %e,
                    "Failed to update heartbeat. The execution may be seen as dead and \
                     claimed by another scheduler."
                );
                self.listeners
                    .on_scheduler_event(SchedulerEvent::UnexpectedError);
                self.listeners
                    .on_execution_failed_heartbeat(&currently_executing);
            }
        }
    }

    /// Find picked executions whose owner stopped heartbeating and hand
    /// them to their task's dead-execution handler.
    async fn detect_dead_executions(&self) {
        let now = self.clock.now();
        let max_age = chrono::Duration::from_std(self.config.max_age_before_considered_dead())
            .unwrap_or(chrono::Duration::MAX);
        let older_than = now
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let dead = match self.store.get_dead_executions(older_than).await {
            Ok(dead) => dead,
            Err(e) => {
                error!(error = %e, "Failed to fetch dead executions");
                self.listeners
                    .on_scheduler_event(SchedulerEvent::UnexpectedError);
                return;
            }
        };
        if dead.is_empty() {
            trace!("No dead executions found");
            return;
        }

        warn!(count = dead.len(), "Found dead executions, handling");
        for execution in dead {
            self.listeners.on_execution_dead(&execution);

            let Some(task) = self.resolver.resolve(&execution.task_instance.task_name) else {
                warn!(
                    task = %execution.task_instance.task_name,
                    "Found dead execution for unknown task type, cannot handle it"
                );
                self.listeners
                    .on_scheduler_event(SchedulerEvent::UnexpectedError);
                continue;
            };

            let ops = ExecutionOperations::new(
                Arc::clone(&self.store),
                Arc::clone(&self.listeners),
                execution.clone(),
            );
            if let Err(e) = task
                .dead_execution_handler()
                .on_dead(&execution, now, &ops)
                .await
            {
                error!(
                    execution = %execution.task_instance.task_and_instance(),
                    error = %e,
                    "Dead-execution handler failed, the execution remains picked"
                );
                self.listeners
                    .on_scheduler_event(SchedulerEvent::UnexpectedError);
            }
        }
    }
}
