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

//! Polling and batching behavior: stale-batch short-circuiting, adaptive
//! replenishment and the lock-and-fetch fast path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use serial_test::serial;

use camshaft::{
    Completion, Execution, ExecutionContext, ExecutionStore, Scheduler, SchedulerConfig,
    StatsCounters, Task, TaskInstance,
};

use crate::fixtures::{init_tracing, wait_until, CountingStore, Gate, LockAndFetchStore};

fn due_now(task: &str, id: &str) -> Execution {
    Execution::new(
        TaskInstance::new(task, id, json!({})),
        Utc::now() - chrono::Duration::seconds(5),
    )
}

/// Once a batch's generation is behind the current one, its remaining
/// candidates are abandoned without `claim` round-trips.
///
/// Serialized: the assertions depend on poll/complete interleavings that
/// parallel test load can stretch past their wait windows.
#[tokio::test]
#[serial]
async fn stale_batch_issues_no_further_claims() {
    init_tracing();
    let store = Arc::new(CountingStore::new());
    let stats = Arc::new(StatsCounters::new());
    let gate = Gate::new();

    // Pool of one: the first candidate occupies the only slot while the
    // rest of its batch queues behind it.
    let body_gate = gate.clone();
    let task = Task::blocking("gated", move |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        body_gate.enter_and_wait();
        Ok(Completion::Remove)
    });
    let scheduler = Scheduler::builder(store.clone())
        .task(task)
        .config(SchedulerConfig {
            worker_pool_size: 1,
            poll_interval: Duration::from_secs(3600),
            ..SchedulerConfig::new("stale-test")
        })
        .listener(stats.clone())
        .build()
        .unwrap();

    for id in ["a", "b", "c"] {
        store
            .create_if_not_exists(&due_now("gated", id))
            .await
            .unwrap();
    }

    // First poll fetches all three (a full page: upper limit = 3 * pool).
    scheduler.start().await.unwrap();
    wait_until(
        "first candidate claimed and executing",
        Duration::from_secs(5),
        || gate.started() == 1 && stats.ran_execute_due() >= 1,
    )
    .await;
    assert_eq!(store.claim_calls(), 1);

    // A second poll supersedes the first batch while two of its
    // candidates are still queued for the pool.
    scheduler.trigger_check_for_due_executions();
    wait_until("second poll cycle", Duration::from_secs(5), || {
        stats.ran_execute_due() >= 2
    })
    .await;

    gate.open();
    wait_until("all executions to finish", Duration::from_secs(5), || {
        store.inner().is_empty()
    })
    .await;

    // One claim from the superseded batch, two from the fresh one. The
    // two queued candidates of the first batch were dropped unclaimed.
    assert_eq!(store.claim_calls(), 3);
    assert_eq!(stats.candidates_stale(), 2);
    assert_eq!(stats.candidates_executed(), 3);

    scheduler.stop().await;
}

/// With lower limit 2 and a full fetch of 10, the replenish trigger fires
/// exactly once, at the moment the batch's remaining count first reaches
/// 2, causing exactly one out-of-cycle poll.
#[tokio::test]
#[serial]
async fn replenish_trigger_fires_once_per_batch() {
    init_tracing();
    let store = Arc::new(CountingStore::new());
    let stats = Arc::new(StatsCounters::new());
    let gate = Gate::new();

    // Bodies hold until every candidate has been claimed, so completions
    // (and with them the replenish trigger) happen strictly after the
    // whole batch is picked.
    let body_gate = gate.clone();
    let task = Task::blocking("batched", move |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        body_gate.enter_and_wait();
        Ok(Completion::Remove)
    });
    let scheduler = Scheduler::builder(store.clone())
        .task(task)
        .config(SchedulerConfig {
            worker_pool_size: 10,
            lower_limit_fraction: 0.2,
            upper_limit_fraction: 1.0,
            poll_interval: Duration::from_secs(3600),
            ..SchedulerConfig::new("replenish-test")
        })
        .listener(stats.clone())
        .build()
        .unwrap();

    for id in 0..10 {
        store
            .create_if_not_exists(&due_now("batched", &id.to_string()))
            .await
            .unwrap();
    }

    scheduler.start().await.unwrap();
    wait_until("all candidates claimed", Duration::from_secs(5), || {
        gate.started() == 10
    })
    .await;
    gate.open();
    wait_until("all executions to finish", Duration::from_secs(5), || {
        stats.executions_completed() == 10
    })
    .await;
    // Allow any extra (incorrect) triggers to surface.
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(store.claim_calls(), 10);
    assert_eq!(
        stats.ran_execute_due(),
        2,
        "one scheduled poll plus exactly one replenish-triggered poll"
    );

    scheduler.stop().await;
}

/// Stores exposing the combined lock-and-fetch fast path never see
/// per-candidate claim calls.
#[tokio::test]
async fn lock_and_fetch_store_skips_per_candidate_claims() {
    init_tracing();
    let store = Arc::new(LockAndFetchStore::new());
    let stats = Arc::new(StatsCounters::new());

    let task = Task::blocking("fast", |_instance: &TaskInstance, _ctx: &ExecutionContext| {
        Ok(Completion::Remove)
    });
    let scheduler = Scheduler::builder(store.clone())
        .task(task)
        .config(SchedulerConfig {
            worker_pool_size: 4,
            poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::new("fast-path-test")
        })
        .listener(stats.clone())
        .build()
        .unwrap();

    for id in 0..5 {
        store
            .create_if_not_exists(&due_now("fast", &id.to_string()))
            .await
            .unwrap();
    }

    scheduler.start().await.unwrap();
    wait_until("all executions to finish", Duration::from_secs(5), || {
        stats.executions_completed() == 5
    })
    .await;

    assert!(store.inner().is_empty());
    assert_eq!(
        store.claim_calls(),
        0,
        "fast-path stores must not be claimed row by row"
    );

    scheduler.stop().await;
}
