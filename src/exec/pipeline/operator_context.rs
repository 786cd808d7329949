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
//! Operator-level memory context and counters.
//!
//! Responsibilities:
//! - The entry point operators use to reserve and free memory; forwards to the task.
//! - Exposes the pending handle of a reservation that found the pool full, which the
//!   driver treats as a blocking condition for the whole pipeline.
//! - Collects per-operator counters recorded by the driver.
//!
//! Key exported interfaces:
//! - Types: `OperatorContext`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::blocked::BlockedHandle;
use crate::novaexec_logging::error;
use crate::runtime::stats::OperatorStats;
use crate::runtime::task_context::TaskContext;

struct OperatorMemoryState {
    user_bytes: i64,
    system_bytes: i64,
    peak_user_bytes: i64,
    waiting: BlockedHandle,
    destroyed: bool,
}

pub struct OperatorContext {
    operator_id: i32,
    operator_type: String,
    driver_id: usize,
    task: Arc<TaskContext>,
    memory: Mutex<OperatorMemoryState>,
    counters: Mutex<OperatorStats>,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl OperatorContext {
    pub(crate) fn new(
        operator_id: i32,
        operator_type: impl Into<String>,
        driver_id: usize,
        task: Arc<TaskContext>,
    ) -> Self {
        let operator_type = operator_type.into();
        Self {
            operator_id,
            counters: Mutex::new(OperatorStats::new(operator_id, operator_type.clone())),
            operator_type,
            driver_id,
            task,
            memory: Mutex::new(OperatorMemoryState {
                user_bytes: 0,
                system_bytes: 0,
                peak_user_bytes: 0,
                waiting: BlockedHandle::not_blocked(),
                destroyed: false,
            }),
        }
    }

    pub fn operator_id(&self) -> i32 {
        self.operator_id
    }

    pub fn operator_type(&self) -> &str {
        &self.operator_type
    }

    pub fn driver_id(&self) -> usize {
        self.driver_id
    }

    pub fn task_context(&self) -> &Arc<TaskContext> {
        &self.task
    }

    fn check_live(&self, state: &OperatorMemoryState) -> ExecResult<()> {
        if state.destroyed {
            return Err(ExecError::Internal(format!(
                "operator {} ({}) used after its memory context was destroyed",
                self.operator_id, self.operator_type
            )));
        }
        Ok(())
    }

    /// Reserve user memory. While the returned handle is pending the operator should report
    /// itself blocked; the driver also observes it through `is_waiting_for_memory`.
    pub fn reserve(&self, bytes: i64) -> ExecResult<BlockedHandle> {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        self.check_live(&memory)?;
        let handle = self.task.reserve(bytes)?;
        memory.user_bytes += bytes;
        memory.peak_user_bytes = memory.peak_user_bytes.max(memory.user_bytes);
        if !handle.is_resolved() {
            memory.waiting = handle.clone();
        }
        Ok(handle)
    }

    pub fn try_reserve(&self, bytes: i64) -> ExecResult<bool> {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        self.check_live(&memory)?;
        if !self.task.try_reserve(bytes)? {
            return Ok(false);
        }
        memory.user_bytes += bytes;
        memory.peak_user_bytes = memory.peak_user_bytes.max(memory.user_bytes);
        Ok(true)
    }

    pub fn free(&self, bytes: i64) -> ExecResult<()> {
        {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            if bytes > memory.user_bytes {
                return Err(ExecError::AccountingViolation(format!(
                    "operator {} ({}) freed {} bytes but holds {}",
                    self.operator_id, self.operator_type, bytes, memory.user_bytes
                )));
            }
            memory.user_bytes -= bytes;
        }
        if let Err(err) = self.task.free(bytes) {
            self.memory.lock().unwrap_or_else(|e| e.into_inner()).user_bytes += bytes;
            return Err(err);
        }
        Ok(())
    }

    /// Move the user reservation to exactly `total_bytes`, reserving or freeing the delta.
    pub fn set_memory_reservation(&self, total_bytes: i64) -> ExecResult<BlockedHandle> {
        if total_bytes < 0 {
            return Err(ExecError::InvalidArgument(format!(
                "operator {} memory reservation is negative: {total_bytes}",
                self.operator_id
            )));
        }
        let delta = total_bytes - self.reserved_bytes();
        if delta > 0 {
            self.reserve(delta)
        } else {
            if delta < 0 {
                self.free(-delta)?;
            }
            Ok(BlockedHandle::not_blocked())
        }
    }

    pub fn reserve_system(&self, bytes: i64) -> ExecResult<BlockedHandle> {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        self.check_live(&memory)?;
        let handle = self.task.reserve_system(bytes)?;
        memory.system_bytes += bytes;
        if !handle.is_resolved() {
            memory.waiting = handle.clone();
        }
        Ok(handle)
    }

    pub fn free_system(&self, bytes: i64) -> ExecResult<()> {
        {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            if bytes > memory.system_bytes {
                return Err(ExecError::AccountingViolation(format!(
                    "operator {} ({}) freed {} system bytes but holds {}",
                    self.operator_id, self.operator_type, bytes, memory.system_bytes
                )));
            }
            memory.system_bytes -= bytes;
        }
        if let Err(err) = self.task.free_system(bytes) {
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

    /// Pending handle of the last reservation that found a pool full; resolved otherwise.
    pub fn is_waiting_for_memory(&self) -> BlockedHandle {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        if memory.waiting.is_resolved() {
            BlockedHandle::not_blocked()
        } else {
            memory.waiting.clone()
        }
    }

    /// Normal teardown. Rejected while any reservation is outstanding.
    pub fn destroy(&self) -> ExecResult<()> {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        if memory.user_bytes != 0 || memory.system_bytes != 0 {
            error!(
                "operator {} ({}) of driver {} destroyed with outstanding reservation: user={} system={}",
                self.operator_id,
                self.operator_type,
                self.driver_id,
                memory.user_bytes,
                memory.system_bytes
            );
            return Err(ExecError::AccountingViolation(format!(
                "operator {} ({}) destroyed with user={} system={} bytes still reserved",
                self.operator_id, self.operator_type, memory.user_bytes, memory.system_bytes
            )));
        }
        memory.destroyed = true;
        Ok(())
    }

    /// Abort-path teardown: return whatever is still reserved. Returns the bytes released.
    ///
    /// Frees go up the hierarchy without this context's lock held: releasing memory can
    /// wake and tear down sibling drivers of the same task on this thread.
    pub fn release_all(&self) -> ExecResult<i64> {
        let (user, system) = {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            memory.destroyed = true;
            (
                std::mem::take(&mut memory.user_bytes),
                std::mem::take(&mut memory.system_bytes),
            )
        };
        let mut result = Ok(user + system);
        if user > 0
            && let Err(err) = self.task.free(user)
        {
            self.memory.lock().unwrap_or_else(|e| e.into_inner()).user_bytes += user;
            result = Err(err);
        }
        if system > 0
            && let Err(err) = self.task.free_system(system)
        {
            self.memory.lock().unwrap_or_else(|e| e.into_inner()).system_bytes += system;
            if result.is_ok() {
                result = Err(err);
            }
        }
        result
    }

    pub(crate) fn record_add_input(&self, rows: usize, bytes: usize, wall: Duration, cpu: Duration) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.add_input_calls += 1;
        c.add_input_wall_nanos += nanos(wall);
        c.add_input_cpu_nanos += nanos(cpu);
        c.input_rows += rows as u64;
        c.input_bytes += bytes as u64;
    }

    pub(crate) fn record_get_output(
        &self,
        output: Option<(usize, usize)>,
        wall: Duration,
        cpu: Duration,
    ) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.get_output_calls += 1;
        c.get_output_wall_nanos += nanos(wall);
        c.get_output_cpu_nanos += nanos(cpu);
        if let Some((rows, bytes)) = output {
            c.output_rows += rows as u64;
            c.output_bytes += bytes as u64;
        }
    }

    pub(crate) fn record_finish(&self, wall: Duration, cpu: Duration) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.finish_calls += 1;
        c.finish_wall_nanos += nanos(wall);
        c.finish_cpu_nanos += nanos(cpu);
    }

    pub(crate) fn record_blocked(&self, blocked: bool, wall: Duration) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.blocked = blocked;
        c.blocked_wall_nanos += nanos(wall);
    }

    pub fn stats(&self) -> OperatorStats {
        let mut stats = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        stats.memory_reservation_bytes = memory.user_bytes;
        stats.system_memory_reservation_bytes = memory.system_bytes;
        stats.peak_memory_reservation_bytes = memory.peak_user_bytes;
        stats
    }
}

impl Drop for OperatorContext {
    fn drop(&mut self) {
        let memory = self.memory.get_mut().unwrap_or_else(|e| e.into_inner());
        if memory.user_bytes != 0 || memory.system_bytes != 0 {
            error!(
                "operator {} ({}) dropped with outstanding reservation: user={} system={}",
                self.operator_id, self.operator_type, memory.user_bytes, memory.system_bytes
            );
        }
    }
}
