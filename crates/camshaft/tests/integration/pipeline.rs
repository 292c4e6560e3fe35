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

//! End-to-end pipeline behavior: completion and failure routing, handler
//! error containment, execution-mode parity and dead-execution revival.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;

use camshaft::{
    AsyncExecutionHandler, Completion, Execution, ExecutionContext, ExecutionStore,
    InMemoryExecutionStore, ManualClock, RetryLater, Schedule, Scheduler, SchedulerConfig,
    StatsCounters, Task, TaskInstance,
};

use crate::fixtures::{init_tracing, wait_until, CollectingListener};

fn test_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn fast_poll_config(name: &str) -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(20),
        ..SchedulerConfig::new(name)
    }
}

/// A recurring task completing successfully at time T with schedule S
/// yields a row with `execution_time == S.next(T)` and `picked == false`.
#[tokio::test]
async fn successful_completion_reschedules_on_schedule() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let clock = ManualClock::at(test_time());

    let task = Task::blocking("recurring", |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        Ok(Completion::reschedule(Schedule::fixed_delay(
            Duration::from_secs(3600),
        )))
    });
    let scheduler = Scheduler::builder(store.clone())
        .task(task)
        .config(fast_poll_config("reschedule-test"))
        .clock(Arc::new(clock))
        .build()
        .unwrap();

    store
        .create_if_not_exists(&Execution::new(
            TaskInstance::new("recurring", "1", json!({})),
            test_time() - chrono::Duration::minutes(1),
        ))
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    wait_until("row to be rescheduled", Duration::from_secs(5), || {
        store
            .get("recurring", "1")
            .is_some_and(|row| row.execution_time > test_time())
    })
    .await;

    let row = store.get("recurring", "1").unwrap();
    assert_eq!(
        row.execution_time,
        test_time() + chrono::Duration::hours(1),
        "next run must be schedule.next(completion time)"
    );
    assert!(!row.picked);
    assert!(row.picked_by.is_none());
    assert_eq!(row.last_success, Some(test_time()));
    assert_eq!(row.consecutive_failures, 0);

    scheduler.stop().await;
}

/// A one-time task failing under RetryLater(5m) yields
/// `execution_time == failure time + 5m`, `picked == false`, row kept.
#[tokio::test]
async fn failed_attempt_retries_later() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let clock = ManualClock::at(test_time());
    let stats = Arc::new(StatsCounters::new());

    let task = Task::blocking("flaky", |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        Err(anyhow::anyhow!("downstream service unavailable"))
    })
    .with_failure_handler(RetryLater::new(Duration::from_secs(300)));
    let scheduler = Scheduler::builder(store.clone())
        .task(task)
        .config(fast_poll_config("retry-test"))
        .clock(Arc::new(clock))
        .listener(stats.clone())
        .build()
        .unwrap();

    store
        .create_if_not_exists(&Execution::new(
            TaskInstance::new("flaky", "1", json!({})),
            test_time() - chrono::Duration::minutes(1),
        ))
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    wait_until("failure to be recorded", Duration::from_secs(5), || {
        stats.executions_failed() == 1
    })
    .await;
    wait_until("row to be rescheduled", Duration::from_secs(5), || {
        store.get("flaky", "1").is_some_and(|row| !row.picked)
    })
    .await;

    let row = store.get("flaky", "1").unwrap();
    assert_eq!(row.execution_time, test_time() + chrono::Duration::minutes(5));
    assert!(!row.picked);
    assert_eq!(row.consecutive_failures, 1);
    assert_eq!(row.last_failure, Some(test_time()));

    scheduler.stop().await;
}

/// An error inside the completion handler leaves the row picked,
/// increments the completion-handler-error counter exactly once, and does
/// not propagate out of the pipeline.
#[tokio::test]
async fn completion_handler_errors_are_contained() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let stats = Arc::new(StatsCounters::new());

    // The body succeeds but its completion cannot be applied: computing
    // the next run from a malformed cron expression fails inside the
    // completion handling.
    let task = Task::blocking("bad-completion", |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        Ok(Completion::reschedule(Schedule::cron("this is not cron")))
    });
    let scheduler = Scheduler::builder(store.clone())
        .task(task)
        .config(fast_poll_config("containment-test"))
        .listener(stats.clone())
        .build()
        .unwrap();

    store
        .create_if_not_exists(&Execution::new(
            TaskInstance::new("bad-completion", "1", json!({})),
            Utc::now() - chrono::Duration::minutes(1),
        ))
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    wait_until(
        "completion handler error to be counted",
        Duration::from_secs(5),
        || stats.completion_handler_errors() == 1,
    )
    .await;
    // Give the scheduler time to (incorrectly) retry or crash.
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(stats.completion_handler_errors(), 1);
    let row = store.get("bad-completion", "1").unwrap();
    assert!(
        row.picked,
        "execution must stay locked until the dead-execution sweep"
    );
    // The scheduler is still alive and polling.
    assert!(stats.ran_execute_due() > 1);

    scheduler.stop().await;
}

struct AsyncBody {
    fail: bool,
}

#[async_trait]
impl AsyncExecutionHandler for AsyncBody {
    async fn execute_async(
        &self,
        _instance: &TaskInstance,
        _ctx: &ExecutionContext,
    ) -> Result<Completion, anyhow::Error> {
        tokio::task::yield_now().await;
        if self.fail {
            Err(anyhow::anyhow!("async body failed"))
        } else {
            Ok(Completion::Remove)
        }
    }
}

/// Blocking and asynchronous pipelines produce completion events with
/// identical semantics: same outcome classification, timestamps ordered
/// started <= done.
#[tokio::test]
async fn blocking_and_async_pipelines_have_identical_completion_contract() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let clock = ManualClock::at(test_time());
    let listener = Arc::new(CollectingListener::new());

    let retry = || RetryLater::new(Duration::from_secs(600));
    let tasks = vec![
        Task::blocking("blocking-ok", |_i: &TaskInstance, _c: &ExecutionContext| {
            Ok(Completion::Remove)
        }),
        Task::blocking("blocking-err", |_i: &TaskInstance, _c: &ExecutionContext| {
            Err(anyhow::anyhow!("blocking body failed"))
        })
        .with_failure_handler(retry()),
        Task::asynchronous("async-ok", AsyncBody { fail: false }),
        Task::asynchronous("async-err", AsyncBody { fail: true }).with_failure_handler(retry()),
    ];

    let scheduler = Scheduler::builder(store.clone())
        .tasks(tasks)
        .config(fast_poll_config("parity-test"))
        .clock(Arc::new(clock))
        .listener(listener.clone())
        .build()
        .unwrap();

    for task_name in ["blocking-ok", "blocking-err", "async-ok", "async-err"] {
        store
            .create_if_not_exists(&Execution::new(
                TaskInstance::new(task_name, "1", json!({})),
                test_time() - chrono::Duration::minutes(1),
            ))
            .await
            .unwrap();
    }

    scheduler.start().await.unwrap();
    wait_until("all four completions", Duration::from_secs(5), || {
        listener.completions().len() == 4
    })
    .await;

    let completions = listener.completions();
    let record = |name: &str| {
        completions
            .iter()
            .find(|r| r.task_name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no completion recorded for {name}"))
    };

    let blocking_ok = record("blocking-ok");
    let async_ok = record("async-ok");
    assert!(blocking_ok.success && async_ok.success);

    let blocking_err = record("blocking-err");
    let async_err = record("async-err");
    assert!(!blocking_err.success && !async_err.success);

    for record in &completions {
        assert!(
            record.started_before_done,
            "{}: started must not exceed done",
            record.task_name
        );
    }

    // Identical durable effects too: both failures rescheduled unpicked.
    for task_name in ["blocking-err", "async-err"] {
        let row = store.get(task_name, "1").unwrap();
        assert!(!row.picked);
        assert_eq!(row.consecutive_failures, 1);
    }
    // Both successes removed their rows.
    assert!(store.get("blocking-ok", "1").is_none());
    assert!(store.get("async-ok", "1").is_none());

    scheduler.stop().await;
}

/// A picked execution whose owner stopped heartbeating is revived by the
/// dead-execution sweep and then picked up and run by a live scheduler.
#[tokio::test]
async fn dead_execution_is_revived_and_rerun() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let stats = Arc::new(StatsCounters::new());

    let task = Task::blocking("orphaned", |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        Ok(Completion::Remove)
    });
    let scheduler = Scheduler::builder(store.clone())
        .task(task)
        .config(SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            missed_heartbeats_limit: 2,
            ..SchedulerConfig::new("sweeper")
        })
        .listener(stats.clone())
        .build()
        .unwrap();

    // Simulate a crashed owner: claimed an hour ago, never heartbeated
    // since.
    let execution = Execution::new(
        TaskInstance::new("orphaned", "1", json!({})),
        Utc::now() - chrono::Duration::hours(2),
    );
    store.create_if_not_exists(&execution).await.unwrap();
    store
        .claim(
            &execution,
            Utc::now() - chrono::Duration::hours(1),
            "crashed-node",
        )
        .await
        .unwrap()
        .expect("claim of fresh row must succeed");

    scheduler.start().await.unwrap();
    wait_until(
        "dead execution to be revived and run",
        Duration::from_secs(5),
        || stats.executions_completed() == 1,
    )
    .await;

    assert_eq!(stats.executions_dead(), 1);
    assert!(store.get("orphaned", "1").is_none(), "row removed after rerun");

    scheduler.stop().await;
}

/// A claimed execution whose task name no longer resolves is dropped with
/// an unexpected-error event and stays picked for the sweep to recover.
#[tokio::test]
async fn unresolvable_task_is_recorded_and_dropped() {
    init_tracing();
    let store = Arc::new(InMemoryExecutionStore::new());
    let stats = Arc::new(StatsCounters::new());

    let task = Task::blocking("known", |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        Ok(Completion::Remove)
    });
    let scheduler = Scheduler::builder(store.clone())
        .task(task)
        .config(fast_poll_config("unresolved-test"))
        .listener(stats.clone())
        .build()
        .unwrap();

    store
        .create_if_not_exists(&Execution::new(
            TaskInstance::new("retired-task", "1", json!({})),
            Utc::now() - chrono::Duration::minutes(1),
        ))
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    wait_until("unexpected error to be counted", Duration::from_secs(5), || {
        stats.unexpected_errors() >= 1
    })
    .await;

    let row = store.get("retired-task", "1").unwrap();
    assert!(row.picked, "execution stays locked for the sweep");
    assert_eq!(stats.executions_completed(), 0);
    assert_eq!(stats.executions_failed(), 0);

    scheduler.stop().await;
}
