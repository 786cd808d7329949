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
//! Driver executor and worker pool.
//!
//! Responsibilities:
//! - Runs ready drivers on a bounded set of worker threads, one time slice at a time.
//! - Parks blocked drivers on their `BlockedHandle` and re-enqueues each exactly once when
//!   the handle resolves; no worker thread waits on a blocked driver.
//! - Reports terminal drivers to their `TaskExecution`.
//!
//! Key exported interfaces:
//! - Types: `DriverExecutor`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::common::app_config::RuntimeConfig;
use crate::common::status::{ExecError, ExecResult};
use crate::novaexec_logging::{debug, error, info};

use super::driver::{Driver, DriverStep};
use super::task_execution::TaskExecution;

/// Schedulable unit: a driver plus the completion tracker of its task.
struct DriverTask {
    driver: Arc<Driver>,
    execution: Arc<TaskExecution>,
}

thread_local!(
    /// Drivers waiting for the outermost `cancel_inline` frame on this thread.
    static TLS_PENDING_TEARDOWN: RefCell<Option<VecDeque<DriverTask>>> =
        const { RefCell::new(None) };
);

impl DriverTask {
    /// Tear the driver down on the calling thread. Used once the pool is gone.
    ///
    /// Teardown frees memory, and a free can resolve the handle of another parked driver
    /// on this same thread. Those nested requests are queued and run by the outermost
    /// frame, so one driver's teardown never runs inside another's.
    fn cancel_inline(self) {
        let first = TLS_PENDING_TEARDOWN.with(|pending| {
            let mut pending = pending.borrow_mut();
            match pending.as_mut() {
                Some(queue) => {
                    queue.push_back(self);
                    None
                }
                None => {
                    *pending = Some(VecDeque::new());
                    Some(self)
                }
            }
        });
        let mut next = first;
        while let Some(task) = next {
            task.teardown();
            next = TLS_PENDING_TEARDOWN.with(|pending| {
                let mut pending = pending.borrow_mut();
                let task = pending.as_mut().and_then(VecDeque::pop_front);
                if task.is_none() {
                    *pending = None;
                }
                task
            });
        }
    }

    fn teardown(self) {
        self.driver.cancel();
        let step = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.driver.process()))
            .unwrap_or_else(|payload| {
                let msg = panic_message(payload.as_ref());
                self.driver.abort(ExecError::Internal(format!(
                    "panic in driver teardown: {msg}"
                )))
            });
        if !step.is_terminal() {
            self.driver.abort(ExecError::Cancelled(
                "driver executor shut down".to_string(),
            ));
        }
        self.execution.driver_finished();
    }
}

struct ExecutorShared {
    queue: Mutex<VecDeque<DriverTask>>,
    cv: Condvar,
    shutdown: AtomicBool,
    time_slice: Duration,
}

impl ExecutorShared {
    fn enqueue(&self, task: DriverTask) {
        let mut queue = self.queue.lock().expect("driver executor queue lock");
        if self.shutdown.load(Ordering::Acquire) {
            drop(queue);
            task.cancel_inline();
            return;
        }
        queue.push_back(task);
        self.cv.notify_one();
    }
}

/// Bounded worker pool that runs drivers cooperatively.
pub struct DriverExecutor {
    shared: Arc<ExecutorShared>,
    num_threads: usize,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DriverExecutor {
    pub fn new(num_threads: usize, time_slice: Duration) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(ExecutorShared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            time_slice: time_slice.max(Duration::from_millis(1)),
        });
        let mut workers = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("pip_exec_{idx}"))
                .spawn(move || worker_loop(shared_cloned));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => error!("failed to spawn pipeline worker {}: {}", idx, err),
            }
        }
        info!(
            "driver executor started: threads={} time_slice_ms={}",
            workers.len(),
            shared.time_slice.as_millis()
        );
        Self {
            shared,
            num_threads: workers.len(),
            workers: Mutex::new(workers),
        }
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self::new(
            cfg.actual_exec_threads(),
            Duration::from_millis(cfg.driver_time_slice_ms),
        )
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn num_queued(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("driver executor queue lock")
            .len()
    }

    /// Enqueue `driver`. A driver can be submitted once.
    pub fn submit(&self, driver: Arc<Driver>, execution: Arc<TaskExecution>) -> ExecResult<()> {
        if !driver.try_mark_submitted() {
            return Err(ExecError::InvalidArgument(format!(
                "driver {} was already submitted",
                driver.driver_id()
            )));
        }
        self.shared.enqueue(DriverTask { driver, execution });
        Ok(())
    }

    /// Stop the workers. Queued drivers, and drivers whose blocked handle resolves later,
    /// are cancelled and torn down on the calling thread.
    pub fn shutdown(&self) {
        let drained: Vec<DriverTask> = {
            let mut queue = self.shared.queue.lock().expect("driver executor queue lock");
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            self.shared.cv.notify_all();
            queue.drain(..).collect()
        };
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            if worker.join().is_err() {
                error!("pipeline worker panicked during shutdown");
            }
        }
        let num_drained = drained.len();
        for task in drained {
            task.cancel_inline();
        }
        info!("driver executor stopped: cancelled_queued_drivers={}", num_drained);
    }
}

impl Drop for DriverExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn worker_loop(shared: Arc<ExecutorShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("driver executor queue lock");
            while queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                queue = shared
                    .cv
                    .wait(queue)
                    .expect("driver executor queue condvar wait");
            }
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            queue.pop_front()
        };
        let Some(task) = task else {
            continue;
        };

        let step = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.driver.process_for(shared.time_slice)
        }))
        .unwrap_or_else(|payload| {
            let msg = panic_message(payload.as_ref());
            task.driver.abort(ExecError::Internal(format!(
                "panic in driver execution: {msg}"
            )))
        });

        match step {
            DriverStep::Ready => shared.enqueue(task),
            DriverStep::Blocked(handle) => {
                let weak: Weak<ExecutorShared> = Arc::downgrade(&shared);
                handle.add_continuation(move |outcome| {
                    debug!(
                        "Driver unblocked: driver_id={} outcome={:?}",
                        task.driver.driver_id(),
                        outcome
                    );
                    match weak.upgrade() {
                        Some(shared) => shared.enqueue(task),
                        None => task.cancel_inline(),
                    }
                });
            }
            DriverStep::Finished | DriverStep::Canceled | DriverStep::Failed(_) => {
                task.execution.driver_finished();
            }
        }
    }
}
