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

//! Admission control for execution work.
//!
//! The [`Executor`] owns the bounded worker pool shared by poll-dispatch
//! claims, task bodies and async continuations, plus the bookkeeping the
//! rest of the scheduler reads:
//!
//! - a semaphore whose permits are the pool slots;
//! - the in-flight registry of [`CurrentlyExecuting`] entries, consumed by
//!   the heartbeat loop and graceful shutdown;
//! - an atomic in-queue counter of admitted-but-not-finished candidates,
//!   which gates how much the polling engine fetches on the lock-and-fetch
//!   fast path;
//! - the set of outstanding per-candidate futures, joined (with a bounded
//!   wait, then forced abort) during shutdown.

pub(crate) mod pipeline;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::execution::CurrentlyExecuting;

pub(crate) struct Executor {
    semaphore: Arc<Semaphore>,
    currently_executing: Mutex<HashMap<Uuid, CurrentlyExecuting>>,
    in_queue: AtomicUsize,
    ongoing: tokio::sync::Mutex<JoinSet<()>>,
}

impl Executor {
    pub(crate) fn new(pool_size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(pool_size)),
            currently_executing: Mutex::new(HashMap::new()),
            in_queue: AtomicUsize::new(0),
            ongoing: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Wait for a worker-pool slot. Errors only when the pool has been
    /// closed by shutdown.
    pub(crate) async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }

    /// Spawn a per-candidate unit of work, registering it so shutdown can
    /// join on it.
    pub(crate) async fn submit<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut ongoing = self.ongoing.lock().await;
        // Reap finished units so the set only tracks live work.
        while ongoing.try_join_next().is_some() {}
        ongoing.spawn(future);
    }

    pub(crate) fn add_currently_executing(&self, entry: CurrentlyExecuting) -> Uuid {
        let id = Uuid::new_v4();
        self.currently_executing.lock().insert(id, entry);
        id
    }

    pub(crate) fn remove_currently_executing(&self, id: &Uuid) -> Option<CurrentlyExecuting> {
        self.currently_executing.lock().remove(id)
    }

    /// Snapshot of the in-flight registry.
    pub(crate) fn currently_executing(&self) -> Vec<CurrentlyExecuting> {
        self.currently_executing.lock().values().cloned().collect()
    }

    pub(crate) fn increment_in_queue(&self) {
        self.in_queue.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_in_queue(&self) {
        self.in_queue.fetch_sub(1, Ordering::SeqCst);
    }

    /// Candidates admitted but not yet finished (queued or executing).
    pub(crate) fn number_in_queue_or_processing(&self) -> usize {
        self.in_queue.load(Ordering::SeqCst)
    }

    /// Wake any chain waiting for a slot so it can observe shutdown.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }

    /// Join all outstanding units of work, waiting at most `grace` before
    /// aborting whatever is left.
    pub(crate) async fn join_ongoing(&self, grace: Duration) {
        let mut ongoing = self.ongoing.lock().await;
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            match tokio::time::timeout_at(deadline, ongoing.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    debug!("All outstanding executions finished");
                    break;
                }
                Err(_) => {
                    warn!(
                        remaining = ongoing.len(),
                        "Graceful shutdown wait elapsed, aborting remaining executions"
                    );
                    ongoing.abort_all();
                    while ongoing.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }
}
