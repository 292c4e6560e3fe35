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

//! # Camshaft
//!
//! A persistent task scheduler: any number of independent processes
//! coordinate execution of one-time and recurring tasks through a shared
//! execution store, with no leader election and no external coordination
//! service. The store's atomic claim is the only cross-process
//! race-breaker: a due execution is run by at most one node at a time,
//! with at-least-once semantics overall.
//!
//! ## Architecture
//!
//! - **Polling engine** ([`scheduler`]): a timer-driven loop fetches due
//!   candidates in generation-tagged batches, admits each one onto the
//!   shared worker pool, and refetches early when a batch runs low.
//!   Batches superseded by a newer poll are abandoned without store calls.
//! - **Admission control** ([`executor`]): one bounded pool shared by
//!   claim attempts, task bodies and async continuations, with an
//!   in-flight registry feeding heartbeats and graceful shutdown.
//! - **Pipelines**: blocking and asynchronous task bodies run through
//!   separate pipelines that produce identical completion events, so
//!   policy handlers are execution-mode-agnostic.
//! - **Policy handlers** ([`task::handlers`]): pluggable completion,
//!   failure and dead-execution strategies convert each outcome into the
//!   row's next durable state. A handler error leaves the row picked;
//!   the dead-execution sweep is the universal recovery path.
//! - **Store contract** ([`store`]): the scheduler core is agnostic to the
//!   storage backend and only calls the [`store::ExecutionStore`] trait.
//!   An in-memory reference implementation ships with the crate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use camshaft::{
//!     Completion, ExecutionContext, Scheduler, SchedulerConfig, Task, TaskInstance,
//!     store::InMemoryExecutionStore,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryExecutionStore::new());
//!
//! let notify = Task::blocking("notify-user", |instance: &TaskInstance, _ctx: &ExecutionContext| {
//!     println!("notifying {}", instance.id);
//!     Ok(Completion::Remove)
//! });
//!
//! let scheduler = Scheduler::builder(store)
//!     .task(notify)
//!     .config(SchedulerConfig::new("node-1"))
//!     .build()?;
//!
//! scheduler.start().await?;
//! scheduler
//!     .schedule(
//!         TaskInstance::new("notify-user", "42", serde_json::json!({})),
//!         Utc::now(),
//!     )
//!     .await?;
//! # scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod executor;
pub mod scheduler;
pub mod store;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::{HandlerError, ScheduleError, SchedulerError, StoreError};
pub use events::{
    CandidateEvent, MetricsListener, SchedulerEvent, SchedulerListener, StatsCounters,
};
pub use execution::{
    CurrentlyExecuting, Execution, ExecutionComplete, ExecutionOperations, ExecutionOutcome,
    TaskInstance,
};
pub use scheduler::state::{LifecyclePhase, SchedulerState};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use store::{ExecutionStore, InMemoryExecutionStore};
pub use task::handlers::{
    Completion, DeadExecutionHandler, FailureHandler, MaxRetries, RescheduleOnFailure,
    RescheduleUsingTaskData, RetryLater, ReviveDeadExecution,
};
pub use task::schedule::Schedule;
pub use task::{
    AsyncExecutionHandler, ExecutionContext, ExecutionHandler, Task, TaskResolver, TaskRun,
};
