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

//! Execution store contract.
//!
//! The store is the single shared resource between scheduler processes and
//! the sole arbiter of who runs what. Its atomic [`claim`](ExecutionStore::claim)
//! is the cross-process race-breaker: a claim that loses observes no change
//! and returns `None`, never a partial or corrupted state, and never an
//! error.
//!
//! Concrete SQL dialects, schema and row-lock hints are the store
//! implementation's concern; the scheduler core only calls this trait.

mod memory;

pub use memory::InMemoryExecutionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreError;
use crate::execution::Execution;

/// Durable storage for execution rows.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution unless one with the same `(task_name, id)`
    /// identity already exists. Returns whether a row was created.
    async fn create_if_not_exists(&self, execution: &Execution) -> Result<bool, StoreError>;

    /// Up to `limit` unpicked executions with `execution_time <= now`,
    /// ordered by `execution_time` ascending.
    async fn get_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Atomically transition `candidate` from unpicked to picked.
    ///
    /// The compare-and-swap must match the candidate's `(picked, version)`
    /// as fetched; on success the stored row has `picked = true`,
    /// `picked_by`, a fresh heartbeat and an incremented version, and that
    /// row is returned. `None` means another actor won the race.
    async fn claim(
        &self,
        candidate: &Execution,
        now: DateTime<Utc>,
        picked_by: &str,
    ) -> Result<Option<Execution>, StoreError>;

    /// Combined fetch-and-claim fast path for backends that can express it
    /// (e.g. `FOR UPDATE SKIP LOCKED`). Returns `None` when unsupported,
    /// in which case the scheduler falls back to `get_due` + `claim`.
    async fn lock_and_fetch(
        &self,
        _now: DateTime<Utc>,
        _limit: usize,
        _picked_by: &str,
    ) -> Result<Option<Vec<Execution>>, StoreError> {
        Ok(None)
    }

    /// Write `execution` back as unpicked and due at `next_time`.
    ///
    /// When `new_data` is `Some`, the payload is replaced wholesale. The
    /// failure bookkeeping fields are set to exactly the values given.
    async fn reschedule(
        &self,
        execution: &Execution,
        next_time: DateTime<Utc>,
        new_data: Option<Value>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: i32,
    ) -> Result<(), StoreError>;

    /// Delete the execution row.
    async fn remove(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Refresh the heartbeat on a picked execution. Implementations should
    /// fail (rather than silently succeed) when the row no longer matches,
    /// so the scheduler can surface the failed heartbeat.
    async fn update_heartbeat(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Picked executions whose heartbeat is older than `older_than`,
    /// presumed orphaned by a crashed owner.
    async fn get_dead_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError>;
}
