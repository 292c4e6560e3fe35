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

//! Scheduler lifecycle: start/stop transitions, immediate checks for due
//! work and graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use camshaft::{
    Completion, ExecutionContext, ExecutionStore, InMemoryExecutionStore, LifecyclePhase,
    Scheduler, SchedulerConfig, SchedulerError, StatsCounters, Task, TaskInstance,
};

use crate::fixtures::{init_tracing, wait_until, Gate};

fn counting_task(name: &str, counter: Arc<AtomicUsize>) -> Task {
    Task::blocking(name, move |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Completion::Remove)
    })
}

#[tokio::test]
async fn start_twice_is_an_error() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Scheduler::builder(store)
        .task(counting_task("noop", Arc::new(AtomicUsize::new(0))))
        .config(SchedulerConfig::new("double-start"))
        .build()
        .unwrap();

    scheduler.start().await.unwrap();
    assert!(matches!(
        scheduler.start().await,
        Err(SchedulerError::AlreadyStarted)
    ));
    scheduler.stop().await;
}

#[tokio::test]
async fn building_without_tasks_is_an_error() {
    let store = Arc::new(InMemoryExecutionStore::new());
    assert!(matches!(
        Scheduler::builder(store).build(),
        Err(SchedulerError::NoTasks)
    ));
}

#[tokio::test]
async fn lifecycle_advances_through_phases() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Scheduler::builder(store)
        .task(counting_task("noop", Arc::new(AtomicUsize::new(0))))
        .config(SchedulerConfig::new("phases"))
        .build()
        .unwrap();

    assert_eq!(scheduler.state().phase(), LifecyclePhase::Created);
    scheduler.start().await.unwrap();
    assert_eq!(scheduler.state().phase(), LifecyclePhase::Started);
    assert!(scheduler.state().is_started());

    scheduler.stop().await;
    assert_eq!(scheduler.state().phase(), LifecyclePhase::Stopped);
    assert!(scheduler.state().is_shutting_down());
    // Stopping again is a quiet no-op.
    scheduler.stop().await;
}

/// Scheduling an already-due instance triggers an immediate check instead
/// of waiting out the poll interval.
#[tokio::test]
async fn scheduling_due_work_short_circuits_the_poll_timer() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let executed = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::builder(store)
        .task(counting_task("prompt", executed.clone()))
        .config(SchedulerConfig {
            // Long enough that only an immediate check can explain a run.
            poll_interval: Duration::from_secs(3600),
            ..SchedulerConfig::new("immediate-check")
        })
        .build()
        .unwrap();

    scheduler.start().await.unwrap();
    // Let the startup poll pass with nothing to do.
    tokio::time::sleep(Duration::from_millis(50)).await;

    scheduler
        .schedule(TaskInstance::new("prompt", "1", json!({})), Utc::now())
        .await
        .unwrap();

    wait_until("immediate execution", Duration::from_secs(2), || {
        executed.load(Ordering::SeqCst) == 1
    })
    .await;

    scheduler.stop().await;
}

#[tokio::test]
async fn scheduling_is_idempotent_per_identity() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = Scheduler::builder(store.clone())
        .task(counting_task("idem", Arc::new(AtomicUsize::new(0))))
        .config(SchedulerConfig::new("idempotent"))
        .build()
        .unwrap();

    let later = Utc::now() + chrono::Duration::hours(1);
    let instance = TaskInstance::new("idem", "1", json!({}));
    assert!(scheduler.schedule(instance.clone(), later).await.unwrap());
    assert!(!scheduler.schedule(instance, later).await.unwrap());
    assert_eq!(store.len(), 1);
}

/// Work scheduled before `start()` is picked up by the startup poll even
/// though the immediate-check trigger ignores a not-yet-started scheduler.
#[tokio::test]
async fn work_scheduled_before_start_runs_on_startup_poll() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let executed = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::builder(store)
        .task(counting_task("early", executed.clone()))
        .config(SchedulerConfig::new("early-bird"))
        .build()
        .unwrap();

    scheduler
        .schedule(TaskInstance::new("early", "1", json!({})), Utc::now())
        .await
        .unwrap();
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    scheduler.start().await.unwrap();
    wait_until("startup poll execution", Duration::from_secs(2), || {
        executed.load(Ordering::SeqCst) == 1
    })
    .await;

    scheduler.stop().await;
}

/// Graceful shutdown waits for in-flight executions and completes their
/// store bookkeeping before returning.
#[tokio::test]
async fn stop_waits_for_in_flight_executions() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let stats = Arc::new(StatsCounters::new());
    let gate = Gate::new();

    let body_gate = gate.clone();
    let task = Task::blocking("slow", move |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        body_gate.enter_and_wait();
        Ok(Completion::Remove)
    });
    let scheduler = Arc::new(
        Scheduler::builder(store.clone())
            .task(task)
            .config(SchedulerConfig {
                poll_interval: Duration::from_millis(20),
                shutdown_max_wait: Duration::from_secs(10),
                ..SchedulerConfig::new("graceful")
            })
            .listener(stats.clone())
            .build()
            .unwrap(),
    );

    store
        .create_if_not_exists(&camshaft::Execution::new(
            TaskInstance::new("slow", "1", json!({})),
            Utc::now() - chrono::Duration::seconds(1),
        ))
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    wait_until("body to start", Duration::from_secs(5), || {
        gate.started() == 1
    })
    .await;
    assert_eq!(scheduler.currently_executing().len(), 1);

    let stopper = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.stop().await })
    };
    // Shutdown must be blocked on the running body.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopper.is_finished());

    gate.open();
    stopper.await.unwrap();

    assert_eq!(stats.executions_completed(), 1);
    assert!(store.get("slow", "1").is_none(), "completion was persisted");
    assert!(scheduler.currently_executing().is_empty());
}

/// After stop, triggers are ignored and no new work is admitted.
#[tokio::test]
async fn stopped_scheduler_admits_no_new_work() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let executed = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::builder(store.clone())
        .task(counting_task("late", executed.clone()))
        .config(SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::new("stopped")
        })
        .build()
        .unwrap();

    scheduler.start().await.unwrap();
    scheduler.stop().await;

    scheduler
        .schedule(TaskInstance::new("late", "1", json!({})), Utc::now())
        .await
        .unwrap();
    scheduler.trigger_check_for_due_executions();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert!(store.get("late", "1").is_some_and(|row| !row.picked));
}
