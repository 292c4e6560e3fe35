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

//! In-memory execution store.
//!
//! All operations run under one mutex, which serializes concurrent claim
//! attempts the same way a relational backend serializes them with row
//! locks or an immediate transaction. Useful for embedding the scheduler
//! without a database, and as the reference implementation in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::ExecutionStore;
use crate::error::StoreError;
use crate::execution::Execution;

type Identity = (String, String);

#[derive(Default)]
pub struct InMemoryExecutionStore {
    rows: Mutex<HashMap<Identity, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn identity(execution: &Execution) -> Identity {
        (
            execution.task_instance.task_name.clone(),
            execution.task_instance.id.clone(),
        )
    }

    /// Snapshot of a single row, if present.
    pub fn get(&self, task_name: &str, id: &str) -> Option<Execution> {
        self.rows
            .lock()
            .get(&(task_name.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Snapshot of every row, in no particular order.
    pub fn all(&self) -> Vec<Execution> {
        self.rows.lock().values().cloned().collect()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_if_not_exists(&self, execution: &Execution) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock();
        let key = Self::identity(execution);
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, execution.clone());
        Ok(true)
    }

    async fn get_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = self.rows.lock();
        let mut due: Vec<Execution> = rows
            .values()
            .filter(|e| !e.picked && e.execution_time <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.execution_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(
        &self,
        candidate: &Execution,
        now: DateTime<Utc>,
        picked_by: &str,
    ) -> Result<Option<Execution>, StoreError> {
        let mut rows = self.rows.lock();
        let key = Self::identity(candidate);
        match rows.get_mut(&key) {
            Some(row) if !row.picked && row.version == candidate.version => {
                row.picked = true;
                row.picked_by = Some(picked_by.to_string());
                row.last_heartbeat = Some(now);
                row.version += 1;
                Ok(Some(row.clone()))
            }
            // Row gone, already picked, or a different version: lost the race.
            _ => Ok(None),
        }
    }

    async fn reschedule(
        &self,
        execution: &Execution,
        next_time: DateTime<Utc>,
        new_data: Option<Value>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: i32,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        let key = Self::identity(execution);
        let row = rows.get_mut(&key).ok_or_else(|| {
            StoreError::Backend(format!(
                "no row for {} to reschedule",
                execution.task_instance.task_and_instance()
            ))
        })?;

        row.execution_time = next_time;
        row.picked = false;
        row.picked_by = None;
        row.last_heartbeat = None;
        row.version += 1;
        row.last_success = last_success;
        row.last_failure = last_failure;
        row.consecutive_failures = consecutive_failures;
        if let Some(data) = new_data {
            row.task_instance.data = data;
        }
        Ok(())
    }

    async fn remove(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        let key = Self::identity(execution);
        rows.remove(&key).ok_or_else(|| {
            StoreError::Backend(format!(
                "no row for {} to remove",
                execution.task_instance.task_and_instance()
            ))
        })?;
        Ok(())
    }

    async fn update_heartbeat(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        let key = Self::identity(execution);
        match rows.get_mut(&key) {
            Some(row) if row.picked && row.version == execution.version => {
                row.last_heartbeat = Some(now);
                Ok(())
            }
            _ => Err(StoreError::Backend(format!(
                "no matching picked row for heartbeat on {}",
                execution.task_instance.task_and_instance()
            ))),
        }
    }

    async fn get_dead_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = self.rows.lock();
        let mut dead: Vec<Execution> = rows
            .values()
            .filter(|e| e.picked && e.last_heartbeat.is_some_and(|hb| hb < older_than))
            .cloned()
            .collect();
        dead.sort_by_key(|e| e.last_heartbeat);
        Ok(dead)
    }
}
