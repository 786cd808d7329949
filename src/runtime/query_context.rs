// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Query-level memory context and the registry of live queries.
//!
//! Responsibilities:
//! - Aggregates user and system reservations of every task of one query.
//! - Enforces the per-query caps before forwarding a reservation to the shared pools.
//! - Fans query-wide cancellation and failure out to every task.
//!
//! Key exported interfaces:
//! - Types: `QueryContext`, `QueryMemoryLimits`, `QueryContextManager`.
//!
//! Capacity is only checked by the pools. A query cap breach is fatal to the query and is
//! reported as `ExecError::ExceededMemoryLimit`, never as a blocked handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::app_config::QueryConfig;
use crate::common::status::{ExecError, ExecResult, MemoryKind};
use crate::common::types::QueryId;
use crate::exec::pipeline::blocked::BlockedHandle;
use crate::novaexec_logging::{error, info, warn};
use crate::runtime::memory_manager::LocalMemoryManager;
use crate::runtime::memory_pool::MemoryPool;
use crate::runtime::task_context::TaskContext;

/// Per-query ceilings. `None` means unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryMemoryLimits {
    pub max_memory_bytes: Option<i64>,
    pub max_total_memory_bytes: Option<i64>,
}

impl From<&QueryConfig> for QueryMemoryLimits {
    fn from(cfg: &QueryConfig) -> Self {
        Self {
            max_memory_bytes: cfg.max_memory_bytes,
            max_total_memory_bytes: cfg.max_total_memory_bytes,
        }
    }
}

#[derive(Default)]
struct QueryMemoryState {
    user_bytes: i64,
    system_bytes: i64,
    peak_user_bytes: i64,
}

pub struct QueryContext {
    query_id: QueryId,
    limits: QueryMemoryLimits,
    pool: Arc<MemoryPool>,
    system_pool: Arc<MemoryPool>,
    memory: Mutex<QueryMemoryState>,
    tasks: Mutex<Vec<Weak<TaskContext>>>,
    cancelled: AtomicBool,
}

impl QueryContext {
    pub fn new(
        query_id: QueryId,
        limits: QueryMemoryLimits,
        pool: Arc<MemoryPool>,
        system_pool: Arc<MemoryPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            limits,
            pool,
            system_pool,
            memory: Mutex::new(QueryMemoryState::default()),
            tasks: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn limits(&self) -> QueryMemoryLimits {
        self.limits
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn system_memory_pool(&self) -> &Arc<MemoryPool> {
        &self.system_pool
    }

    fn check_limits(
        &self,
        state: &QueryMemoryState,
        kind: MemoryKind,
        bytes: i64,
    ) -> ExecResult<()> {
        if bytes < 0 {
            return Err(ExecError::InvalidArgument(format!(
                "query {} reserve bytes is negative: {bytes}",
                self.query_id
            )));
        }
        if kind == MemoryKind::User
            && let Some(limit) = self.limits.max_memory_bytes
            && state.user_bytes + bytes > limit
        {
            return Err(ExecError::ExceededMemoryLimit {
                query_id: self.query_id,
                kind: MemoryKind::User,
                limit_bytes: limit,
                reserved_bytes: state.user_bytes,
                requested_bytes: bytes,
            });
        }
        if let Some(limit) = self.limits.max_total_memory_bytes {
            let total = state.user_bytes + state.system_bytes;
            if total + bytes > limit {
                return Err(ExecError::ExceededMemoryLimit {
                    query_id: self.query_id,
                    kind: MemoryKind::Total,
                    limit_bytes: limit,
                    reserved_bytes: total,
                    requested_bytes: bytes,
                });
            }
        }
        Ok(())
    }

    /// Reserve user memory. The returned handle is pending while the user pool is full.
    pub fn reserve(&self, bytes: i64) -> ExecResult<BlockedHandle> {
        let mut state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        self.check_limits(&state, MemoryKind::User, bytes)?;
        let handle = self.pool.reserve(self.query_id, bytes)?;
        state.user_bytes += bytes;
        state.peak_user_bytes = state.peak_user_bytes.max(state.user_bytes);
        Ok(handle)
    }

    /// Reserve user memory only if both the query caps and the pool have room.
    pub fn try_reserve(&self, bytes: i64) -> ExecResult<bool> {
        let mut state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        match self.check_limits(&state, MemoryKind::User, bytes) {
            Ok(()) => {}
            Err(ExecError::ExceededMemoryLimit { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        if !self.pool.try_reserve(self.query_id, bytes)? {
            return Ok(false);
        }
        state.user_bytes += bytes;
        state.peak_user_bytes = state.peak_user_bytes.max(state.user_bytes);
        Ok(true)
    }

    /// Return user memory. The pool is called after this context's lock is released,
    /// since a pool free may run wakeup continuations on this thread.
    pub fn free(&self, bytes: i64) -> ExecResult<()> {
        {
            let mut state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            if bytes > state.user_bytes {
                return Err(ExecError::AccountingViolation(format!(
                    "query {} freed {} user bytes but holds {}",
                    self.query_id, bytes, state.user_bytes
                )));
            }
            state.user_bytes -= bytes;
        }
        if let Err(err) = self.pool.free(self.query_id, bytes) {
            self.memory.lock().unwrap_or_else(|e| e.into_inner()).user_bytes += bytes;
            return Err(err);
        }
        Ok(())
    }

    pub fn reserve_system(&self, bytes: i64) -> ExecResult<BlockedHandle> {
        let mut state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        self.check_limits(&state, MemoryKind::System, bytes)?;
        let handle = self.system_pool.reserve(self.query_id, bytes)?;
        state.system_bytes += bytes;
        Ok(handle)
    }

    pub fn free_system(&self, bytes: i64) -> ExecResult<()> {
        {
            let mut state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            if bytes > state.system_bytes {
                return Err(ExecError::AccountingViolation(format!(
                    "query {} freed {} system bytes but holds {}",
                    self.query_id, bytes, state.system_bytes
                )));
            }
            state.system_bytes -= bytes;
        }
        if let Err(err) = self.system_pool.free(self.query_id, bytes) {
            self.memory.lock().unwrap_or_else(|e| e.into_inner()).system_bytes += bytes;
            return Err(err);
        }
        Ok(())
    }

    pub fn reserved_bytes(&self) -> i64 {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .user_bytes
    }

    pub fn system_reserved_bytes(&self) -> i64 {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .system_bytes
    }

    pub fn peak_reserved_bytes(&self) -> i64 {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peak_user_bytes
    }

    pub fn add_task_context(self: &Arc<Self>, task_num: i32) -> Arc<TaskContext> {
        let task = TaskContext::new(Arc::clone(self), task_num);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| t.strong_count() > 0);
        tasks.push(Arc::downgrade(&task));
        if self.cancelled.load(Ordering::Acquire) {
            drop(tasks);
            task.cancel();
        }
        task
    }

    pub fn task_contexts(&self) -> Vec<Arc<TaskContext>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel every live task of this query, and any task added later.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("cancel query {}", self.query_id);
        for task in self.task_contexts() {
            task.cancel();
        }
    }

    /// Fail every live task of this query with `err`.
    pub fn fail(&self, err: ExecError) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if err.is_resource_limit() {
            warn!("query {} killed by memory limit: {}", self.query_id, err);
        } else {
            info!("fail query {}: {}", self.query_id, err);
        }
        for task in self.task_contexts() {
            task.fail(err.clone());
        }
    }

    /// Tear down the query. Every task must have returned its memory first.
    pub fn close(&self) -> ExecResult<()> {
        let state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        if state.user_bytes != 0 || state.system_bytes != 0 {
            error!(
                "query {} closed with outstanding reservation: user={} system={}",
                self.query_id, state.user_bytes, state.system_bytes
            );
            return Err(ExecError::AccountingViolation(format!(
                "query {} closed with user={} system={} bytes still reserved",
                self.query_id, state.user_bytes, state.system_bytes
            )));
        }
        Ok(())
    }
}

impl Drop for QueryContext {
    fn drop(&mut self) {
        let state = self.memory.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.user_bytes != 0 || state.system_bytes != 0 {
            error!(
                "query {} dropped with outstanding reservation: user={} system={}",
                self.query_id, state.user_bytes, state.system_bytes
            );
        }
    }
}

/// Registry of live queries on this process.
pub struct QueryContextManager {
    memory_manager: LocalMemoryManager,
    default_limits: QueryMemoryLimits,
    active: Mutex<HashMap<QueryId, Arc<QueryContext>>>,
}

impl QueryContextManager {
    pub fn new(memory_manager: LocalMemoryManager, default_limits: QueryMemoryLimits) -> Self {
        Self {
            memory_manager,
            default_limits,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn memory_manager(&self) -> &LocalMemoryManager {
        &self.memory_manager
    }

    /// Return the live context for `query_id`, creating it with `limits`
    /// (or the configured defaults) on first use.
    pub fn get_or_register(
        &self,
        query_id: QueryId,
        limits: Option<QueryMemoryLimits>,
    ) -> Arc<QueryContext> {
        let mut guard = self.active.lock().expect("query_ctx_manager lock");
        if let Some(ctx) = guard.get(&query_id) {
            return Arc::clone(ctx);
        }
        let ctx = QueryContext::new(
            query_id,
            limits.unwrap_or(self.default_limits),
            self.memory_manager.general_pool(),
            self.memory_manager.system_pool(),
        );
        guard.insert(query_id, Arc::clone(&ctx));
        ctx
    }

    pub fn get(&self, query_id: QueryId) -> Option<Arc<QueryContext>> {
        self.active
            .lock()
            .expect("query_ctx_manager lock")
            .get(&query_id)
            .cloned()
    }

    pub fn cancel(&self, query_id: QueryId) -> bool {
        match self.get(query_id) {
            Some(ctx) => {
                ctx.cancel();
                true
            }
            None => false,
        }
    }

    /// Close and unregister `query_id`. The context stays registered if closing fails.
    pub fn close(&self, query_id: QueryId) -> ExecResult<()> {
        let mut guard = self.active.lock().expect("query_ctx_manager lock");
        let Some(ctx) = guard.get(&query_id) else {
            return Ok(());
        };
        ctx.close()?;
        guard.remove(&query_id);
        Ok(())
    }

    pub fn num_active(&self) -> usize {
        self.active.lock().expect("query_ctx_manager lock").len()
    }
}
