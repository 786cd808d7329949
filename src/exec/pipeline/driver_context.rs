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
//! Per-driver bookkeeping shared between the driver and its task.
//!
//! Responsibilities:
//! - Owns one `OperatorContext` per operator of the pipeline.
//! - Tracks driver state and wall-clock timings readable without taking the driver lock.
//! - Reports final driver stats to the task exactly once.
//!
//! Key exported interfaces:
//! - Types: `DriverContext`, `DriverState`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::exec::pipeline::operator_context::OperatorContext;
use crate::runtime::stats::DriverStats;
use crate::runtime::task_context::TaskContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverState {
    NotStarted,
    Running,
    Blocked,
    Finished,
    Canceled,
    Failed,
}

impl DriverState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DriverState::Finished | DriverState::Canceled | DriverState::Failed
        )
    }
}

struct DriverTiming {
    state: DriverState,
    created_at: Instant,
    processed: Duration,
    blocked: Duration,
    blocked_since: Option<Instant>,
    ended_at: Option<Instant>,
}

pub struct DriverContext {
    driver_id: usize,
    pipeline_id: i32,
    task: Arc<TaskContext>,
    operators: Mutex<Vec<Arc<OperatorContext>>>,
    timing: Mutex<DriverTiming>,
    reported: AtomicBool,
}

impl DriverContext {
    pub(crate) fn new(driver_id: usize, pipeline_id: i32, task: Arc<TaskContext>) -> Arc<Self> {
        Arc::new(Self {
            driver_id,
            pipeline_id,
            task,
            operators: Mutex::new(Vec::new()),
            timing: Mutex::new(DriverTiming {
                state: DriverState::NotStarted,
                created_at: Instant::now(),
                processed: Duration::ZERO,
                blocked: Duration::ZERO,
                blocked_since: None,
                ended_at: None,
            }),
            reported: AtomicBool::new(false),
        })
    }

    pub fn driver_id(&self) -> usize {
        self.driver_id
    }

    pub fn pipeline_id(&self) -> i32 {
        self.pipeline_id
    }

    pub fn task_context(&self) -> &Arc<TaskContext> {
        &self.task
    }

    pub fn add_operator_context(
        &self,
        operator_id: i32,
        operator_type: impl Into<String>,
    ) -> Arc<OperatorContext> {
        let ctx = Arc::new(OperatorContext::new(
            operator_id,
            operator_type,
            self.driver_id,
            Arc::clone(&self.task),
        ));
        self.operators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&ctx));
        ctx
    }

    pub fn operator_contexts(&self) -> Vec<Arc<OperatorContext>> {
        self.operators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> DriverState {
        self.timing.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Move to `state`, closing any open blocked interval. Terminal states are sticky.
    pub(crate) fn set_state(&self, state: DriverState) {
        let mut timing = self.timing.lock().unwrap_or_else(|e| e.into_inner());
        if timing.state.is_terminal() {
            return;
        }
        let now = Instant::now();
        if let Some(since) = timing.blocked_since.take() {
            timing.blocked += now.saturating_duration_since(since);
        }
        if state == DriverState::Blocked {
            timing.blocked_since = Some(now);
        }
        if state.is_terminal() {
            timing.ended_at = Some(now);
        }
        timing.state = state;
    }

    pub(crate) fn record_processed(&self, elapsed: Duration) {
        let mut timing = self.timing.lock().unwrap_or_else(|e| e.into_inner());
        timing.processed += elapsed;
    }

    pub fn stats(&self) -> DriverStats {
        let (state, elapsed, processed, blocked) = {
            let timing = self.timing.lock().unwrap_or_else(|e| e.into_inner());
            let end = timing.ended_at.unwrap_or_else(Instant::now);
            let mut blocked = timing.blocked;
            if let Some(since) = timing.blocked_since {
                blocked += end.saturating_duration_since(since);
            }
            (
                timing.state,
                end.saturating_duration_since(timing.created_at),
                timing.processed,
                blocked,
            )
        };
        DriverStats {
            driver_id: self.driver_id,
            pipeline_id: self.pipeline_id,
            state,
            elapsed_wall_nanos: elapsed.as_nanos() as u64,
            processed_wall_nanos: processed.as_nanos() as u64,
            blocked_wall_nanos: blocked.as_nanos() as u64,
            operators: self.operator_contexts().iter().map(|op| op.stats()).collect(),
        }
    }

    /// Push the final snapshot into the task. Only the first call reports.
    pub(crate) fn report_final_stats(&self) {
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task.driver_finished(self.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::QueryId;
    use crate::runtime::memory_pool::{MemoryPool, MemoryPoolId};
    use crate::runtime::query_context::{QueryContext, QueryMemoryLimits};

    fn task() -> Arc<TaskContext> {
        let query = QueryContext::new(
            QueryId::new(0, 9),
            QueryMemoryLimits::default(),
            Arc::new(MemoryPool::new(MemoryPoolId::new("user"), 100)),
            Arc::new(MemoryPool::new(MemoryPoolId::new("system"), 100)),
        );
        query.add_task_context(0)
    }

    #[test]
    fn terminal_state_is_sticky() {
        let task = task();
        let driver = task.add_driver_context(0);
        assert_eq!(driver.state(), DriverState::NotStarted);
        driver.set_state(DriverState::Blocked);
        driver.set_state(DriverState::Running);
        driver.set_state(DriverState::Finished);
        driver.set_state(DriverState::Running);
        assert_eq!(driver.state(), DriverState::Finished);
    }

    #[test]
    fn final_stats_are_reported_once() {
        let task = task();
        let driver = task.add_driver_context(3);
        driver.add_operator_context(0, "values");
        driver.add_operator_context(1, "sink");
        driver.set_state(DriverState::Finished);
        driver.report_final_stats();
        driver.report_final_stats();
        let stats = task.stats();
        assert_eq!(stats.total_drivers, 1);
        assert_eq!(stats.completed_drivers, 1);
        assert_eq!(stats.operator_summaries.len(), 2);
    }
}
