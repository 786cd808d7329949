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
//! Task-level memory context and lifecycle.
//!
//! Responsibilities:
//! - Funnels operator reservations of one task up to its query context.
//! - Owns the task's terminal state and the first failure that caused it.
//! - Resolves the pending handles of blocked drivers with a cancellation outcome when the
//!   task is cancelled or fails, so no driver waits forever.
//!
//! Key exported interfaces:
//! - Types: `TaskContext`, `TaskState`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::common::status::{ExecError, ExecResult};
use crate::common::types::TaskId;
use crate::exec::pipeline::blocked::{BlockedHandle, BlockedResolver};
use crate::exec::pipeline::driver_context::{DriverContext, DriverState};
use crate::novaexec_logging::{error, info, warn};
use crate::runtime::query_context::QueryContext;
use crate::runtime::stats::{DriverStats, TaskStats, summarize_operators};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Finished,
    Canceled,
    Failed,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

struct TaskMemoryState {
    user_bytes: i64,
    system_bytes: i64,
    waiting: BlockedHandle,
}

struct TaskLifecycle {
    state: TaskState,
    failure: Option<ExecError>,
    cancellables: Vec<BlockedResolver>,
}

#[derive(Default)]
struct TaskDrivers {
    live: Vec<Weak<DriverContext>>,
    completed: Vec<DriverStats>,
}

pub struct TaskContext {
    task_id: TaskId,
    query: Arc<QueryContext>,
    memory: Mutex<TaskMemoryState>,
    lifecycle: Mutex<TaskLifecycle>,
    drivers: Mutex<TaskDrivers>,
    next_driver_id: AtomicUsize,
}

impl TaskContext {
    pub(crate) fn new(query: Arc<QueryContext>, task_num: i32) -> Arc<Self> {
        let task_id = TaskId::new(query.query_id(), task_num);
        Arc::new(Self {
            task_id,
            query,
            memory: Mutex::new(TaskMemoryState {
                user_bytes: 0,
                system_bytes: 0,
                waiting: BlockedHandle::not_blocked(),
            }),
            lifecycle: Mutex::new(TaskLifecycle {
                state: TaskState::Running,
                failure: None,
                cancellables: Vec::new(),
            }),
            drivers: Mutex::new(TaskDrivers::default()),
            next_driver_id: AtomicUsize::new(0),
        })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn query_context(&self) -> &Arc<QueryContext> {
        &self.query
    }

    pub fn reserve(&self, bytes: i64) -> ExecResult<BlockedHandle> {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        let handle = self.query.reserve(bytes)?;
        memory.user_bytes += bytes;
        if !handle.is_resolved() {
            memory.waiting = handle.clone();
        }
        Ok(handle)
    }

    pub fn try_reserve(&self, bytes: i64) -> ExecResult<bool> {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        if !self.query.try_reserve(bytes)? {
            return Ok(false);
        }
        memory.user_bytes += bytes;
        Ok(true)
    }

    pub fn free(&self, bytes: i64) -> ExecResult<()> {
        {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            if bytes > memory.user_bytes {
                return Err(ExecError::AccountingViolation(format!(
                    "task {} freed {} user bytes but holds {}",
                    self.task_id, bytes, memory.user_bytes
                )));
            }
            memory.user_bytes -= bytes;
        }
        if let Err(err) = self.query.free(bytes) {
            self.memory.lock().unwrap_or_else(|e| e.into_inner()).user_bytes += bytes;
            return Err(err);
        }
        Ok(())
    }

    pub fn reserve_system(&self, bytes: i64) -> ExecResult<BlockedHandle> {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        let handle = self.query.reserve_system(bytes)?;
        memory.system_bytes += bytes;
        Ok(handle)
    }

    pub fn free_system(&self, bytes: i64) -> ExecResult<()> {
        {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            if bytes > memory.system_bytes {
                return Err(ExecError::AccountingViolation(format!(
                    "task {} freed {} system bytes but holds {}",
                    self.task_id, bytes, memory.system_bytes
                )));
            }
            memory.system_bytes -= bytes;
        }
        if let Err(err) = self.query.free_system(bytes) {
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

    /// Pending handle of the last reservation that found the pool full, if still pending.
    pub fn is_waiting_for_memory(&self) -> BlockedHandle {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        if memory.waiting.is_resolved() {
            BlockedHandle::not_blocked()
        } else {
            memory.waiting.clone()
        }
    }

    pub fn add_driver_context(self: &Arc<Self>, pipeline_id: i32) -> Arc<DriverContext> {
        let driver_id = self.next_driver_id.fetch_add(1, Ordering::Relaxed);
        let ctx = DriverContext::new(driver_id, pipeline_id, Arc::clone(self));
        let mut drivers = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
        drivers.live.retain(|d| d.strong_count() > 0);
        drivers.live.push(Arc::downgrade(&ctx));
        ctx
    }

    pub(crate) fn driver_finished(&self, stats: DriverStats) {
        let mut drivers = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
        drivers.completed.push(stats);
    }

    pub fn state(&self) -> TaskState {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
    }

    pub fn failure(&self) -> Option<ExecError> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failure
            .clone()
    }

    /// True once the task was cancelled or failed; drivers abort on their next step.
    pub fn is_aborted(&self) -> bool {
        matches!(self.state(), TaskState::Canceled | TaskState::Failed)
    }

    fn transition(&self, to: TaskState, failure: Option<ExecError>) -> bool {
        let cancellables = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if lifecycle.state.is_done() {
                return false;
            }
            lifecycle.state = to;
            lifecycle.failure = failure;
            std::mem::take(&mut lifecycle.cancellables)
        };
        for resolver in cancellables {
            resolver.cancel();
        }
        true
    }

    pub fn cancel(&self) -> bool {
        let changed = self.transition(TaskState::Canceled, None);
        if changed {
            info!("task {} state: Running -> Canceled", self.task_id);
        }
        changed
    }

    /// Fail the task with its first error. A memory-limit failure also fails the whole query.
    pub fn fail(&self, err: ExecError) -> bool {
        let resource_limit = err.is_resource_limit();
        if !self.transition(TaskState::Failed, Some(err.clone())) {
            return false;
        }
        if resource_limit {
            warn!("task {} failed on memory limit: {}", self.task_id, err);
            self.query.fail(err);
        } else {
            error!("task {} failed: {}", self.task_id, err);
        }
        true
    }

    pub(crate) fn set_finished(&self) -> bool {
        let changed = self.transition(TaskState::Finished, None);
        if changed {
            info!("task {} state: Running -> Finished", self.task_id);
        }
        changed
    }

    /// Attach a resolver that must be cancelled when the task aborts.
    /// Resolved immediately if the task already aborted.
    pub fn register_cancellable(&self, resolver: BlockedResolver) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.state.is_done() {
            drop(lifecycle);
            resolver.cancel();
            return;
        }
        lifecycle.cancellables.retain(|r| !r.is_resolved());
        lifecycle.cancellables.push(resolver);
    }

    #[cfg(test)]
    pub(crate) fn num_cancellables(&self) -> usize {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancellables
            .len()
    }

    pub fn stats(&self) -> TaskStats {
        let (user_bytes, system_bytes) = {
            let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            (memory.user_bytes, memory.system_bytes)
        };
        let (live, completed) = {
            let drivers = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
            let live: Vec<_> = drivers.live.iter().filter_map(Weak::upgrade).collect();
            (live, drivers.completed.clone())
        };
        let mut all = completed;
        let mut queued = 0;
        let mut running = 0;
        let mut blocked = 0;
        for driver in live {
            match driver.state() {
                DriverState::NotStarted => queued += 1,
                DriverState::Running => running += 1,
                DriverState::Blocked => blocked += 1,
                // Terminal drivers already reported their final stats.
                _ => continue,
            }
            all.push(driver.stats());
        }
        let completed_drivers = all.len() - queued - running - blocked;
        TaskStats {
            task_id: self.task_id,
            state: self.state(),
            memory_reservation_bytes: user_bytes,
            system_memory_reservation_bytes: system_bytes,
            total_drivers: all.len(),
            queued_drivers: queued,
            running_drivers: running,
            blocked_drivers: blocked,
            completed_drivers,
            operator_summaries: summarize_operators(all.iter()),
        }
    }

    /// Tear down the task. Every driver must have returned its memory first.
    pub fn close(&self) -> ExecResult<()> {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        if memory.user_bytes != 0 || memory.system_bytes != 0 {
            error!(
                "task {} closed with outstanding reservation: user={} system={}",
                self.task_id, memory.user_bytes, memory.system_bytes
            );
            return Err(ExecError::AccountingViolation(format!(
                "task {} closed with user={} system={} bytes still reserved",
                self.task_id, memory.user_bytes, memory.system_bytes
            )));
        }
        Ok(())
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        let memory = self.memory.get_mut().unwrap_or_else(|e| e.into_inner());
        if memory.user_bytes != 0 || memory.system_bytes != 0 {
            error!(
                "task {} dropped with outstanding reservation: user={} system={}",
                self.task_id, memory.user_bytes, memory.system_bytes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::QueryId;
    use crate::exec::pipeline::blocked::BlockedOutcome;
    use crate::runtime::memory_pool::{MemoryPool, MemoryPoolId};
    use crate::runtime::query_context::QueryMemoryLimits;

    fn query(capacity: i64, limits: QueryMemoryLimits) -> Arc<QueryContext> {
        QueryContext::new(
            QueryId::new(2, 2),
            limits,
            Arc::new(MemoryPool::new(MemoryPoolId::new("user"), capacity)),
            Arc::new(MemoryPool::new(MemoryPoolId::new("system"), capacity)),
        )
    }

    #[test]
    fn task_reservations_roll_up_to_query() {
        let query = query(100, QueryMemoryLimits::default());
        let t0 = query.add_task_context(0);
        let t1 = query.add_task_context(1);
        t0.reserve(30).unwrap();
        t1.reserve(20).unwrap();
        t1.reserve_system(7).unwrap();
        assert_eq!(query.reserved_bytes(), 50);
        assert_eq!(query.system_reserved_bytes(), 7);
        assert!(t0.try_reserve(50).unwrap());
        assert!(!t0.try_reserve(1).unwrap());
        assert!(t0.free(81).unwrap_err().is_accounting_violation());
        t0.free(80).unwrap();
        t1.free(20).unwrap();
        t1.free_system(7).unwrap();
        t0.close().unwrap();
        t1.close().unwrap();
        query.close().unwrap();
    }

    #[test]
    fn waiting_for_memory_tracks_pool() {
        let query = query(10, QueryMemoryLimits::default());
        let task = query.add_task_context(0);
        assert!(task.is_waiting_for_memory().is_resolved());
        let handle = task.reserve(10).unwrap();
        assert!(!handle.is_resolved());
        assert_eq!(task.is_waiting_for_memory(), handle);
        task.free(10).unwrap();
        assert!(task.is_waiting_for_memory().is_resolved());
    }

    #[test]
    fn cancel_resolves_registered_handles() {
        let query = query(10, QueryMemoryLimits::default());
        let task = query.add_task_context(0);
        let (handle, resolver) = BlockedHandle::pending("driver");
        task.register_cancellable(resolver);
        assert!(task.cancel());
        assert!(!task.cancel());
        assert_eq!(handle.outcome(), Some(BlockedOutcome::Cancelled));
        assert_eq!(task.state(), TaskState::Canceled);

        let (late, late_resolver) = BlockedHandle::pending("late");
        task.register_cancellable(late_resolver);
        assert_eq!(late.outcome(), Some(BlockedOutcome::Cancelled));
    }

    #[test]
    fn memory_limit_failure_fails_sibling_tasks() {
        let limits = QueryMemoryLimits {
            max_memory_bytes: Some(5),
            max_total_memory_bytes: None,
        };
        let query = query(100, limits);
        let t0 = query.add_task_context(0);
        let t1 = query.add_task_context(1);
        let err = t0.reserve(6).unwrap_err();
        assert!(t0.fail(err.clone()));
        assert_eq!(t0.state(), TaskState::Failed);
        assert_eq!(t1.state(), TaskState::Failed);
        assert_eq!(t1.failure(), Some(err));
        assert!(query.is_cancelled());
    }

    #[test]
    fn operator_failure_stays_local() {
        let query = query(100, QueryMemoryLimits::default());
        let t0 = query.add_task_context(0);
        let t1 = query.add_task_context(1);
        t0.fail(ExecError::operator("filter", "boom"));
        assert_eq!(t0.state(), TaskState::Failed);
        assert_eq!(t1.state(), TaskState::Running);
    }
}
