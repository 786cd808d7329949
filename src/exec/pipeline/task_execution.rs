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
//! Binds a task's drivers to an executor and tracks their completion.
//!
//! Responsibilities:
//! - Instantiates the drivers of every pipeline of a task and submits them.
//! - Counts drivers down to zero, then settles the task state and checks that the task
//!   returned all of its memory.
//! - Lets callers wait for, or cancel, the whole task.
//!
//! Key exported interfaces:
//! - Types: `TaskExecution`.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::common::status::{ExecError, ExecResult};
use crate::novaexec_logging::{debug, error};
use crate::runtime::task_context::{TaskContext, TaskState};

use super::driver::Driver;
use super::global_driver_executor::DriverExecutor;
use super::pipeline::Pipeline;

#[derive(Debug)]
struct TaskExecutionState {
    remaining: usize,
    settled: bool,
    close_error: Option<ExecError>,
}

/// Completion tracker for the drivers of one task.
pub struct TaskExecution {
    task: Arc<TaskContext>,
    mu: Mutex<TaskExecutionState>,
    cv: Condvar,
}

impl TaskExecution {
    fn new(task: Arc<TaskContext>, driver_count: usize) -> Arc<Self> {
        Arc::new(Self {
            task,
            mu: Mutex::new(TaskExecutionState {
                remaining: driver_count,
                settled: false,
                close_error: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Build the drivers of `pipelines` for `task` and submit them to `executor`.
    pub fn start(
        executor: &DriverExecutor,
        task: Arc<TaskContext>,
        pipelines: &[Pipeline],
    ) -> ExecResult<Arc<Self>> {
        let mut drivers = Vec::new();
        for pipeline in pipelines {
            match pipeline.instantiate_drivers(&task) {
                Ok(mut built) => drivers.append(&mut built),
                Err(err) => {
                    task.fail(err.clone());
                    return Err(err);
                }
            }
        }
        Self::start_drivers(executor, task, drivers)
    }

    /// Submit already-built drivers of `task`.
    pub fn start_drivers(
        executor: &DriverExecutor,
        task: Arc<TaskContext>,
        drivers: Vec<Arc<Driver>>,
    ) -> ExecResult<Arc<Self>> {
        let execution = Self::new(Arc::clone(&task), drivers.len());
        debug!(
            "task {} starting with {} drivers",
            task.task_id(),
            drivers.len()
        );
        if drivers.is_empty() {
            execution.settle();
            return Ok(execution);
        }
        for driver in drivers {
            if let Err(err) = executor.submit(driver, Arc::clone(&execution)) {
                // Drivers that were not submitted never report; count them down here.
                task.fail(err.clone());
                execution.driver_finished();
                error!("task {} failed to submit driver: {}", task.task_id(), err);
            }
        }
        Ok(execution)
    }

    pub fn task_context(&self) -> &Arc<TaskContext> {
        &self.task
    }

    pub(crate) fn driver_finished(&self) {
        let mut st = self.mu.lock().expect("task execution lock");
        if st.remaining == 0 {
            return;
        }
        st.remaining -= 1;
        if st.remaining > 0 {
            return;
        }
        drop(st);
        self.settle();
    }

    fn settle(&self) {
        self.task.set_finished();
        let close_result = self.task.close();
        let mut st = self.mu.lock().expect("task execution lock");
        st.remaining = 0;
        st.settled = true;
        if let Err(err) = close_result {
            st.close_error = Some(err);
        }
        self.cv.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.mu.lock().expect("task execution lock").settled
    }

    fn outcome(&self, st: &TaskExecutionState) -> ExecResult<()> {
        if let Some(err) = &st.close_error {
            return Err(err.clone());
        }
        match self.task.state() {
            TaskState::Finished => Ok(()),
            TaskState::Failed => Err(self
                .task
                .failure()
                .unwrap_or_else(|| ExecError::Internal("task failed without error".to_string()))),
            TaskState::Canceled => Err(ExecError::Cancelled(format!(
                "task {} was cancelled",
                self.task.task_id()
            ))),
            TaskState::Running => Err(ExecError::Internal(format!(
                "task {} completed while still running",
                self.task.task_id()
            ))),
        }
    }

    /// Block until every driver reached a terminal state.
    pub fn wait(&self) -> ExecResult<()> {
        let mut st = self.mu.lock().expect("task execution lock");
        while !st.settled {
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        self.outcome(&st)
    }

    /// Like `wait`, but returns `None` if the drivers are still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExecResult<()>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.mu.lock().expect("task execution lock");
        while !st.settled {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
        Some(self.outcome(&st))
    }

    /// Cancel the task; every driver tears down on its next step.
    pub fn cancel(&self) {
        self.task.cancel();
    }
}
