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
//! Pipeline driver execution loop.
//!
//! Responsibilities:
//! - Advances one linear chain of operators by bounded, non-blocking steps.
//! - Suspends the pipeline with a `BlockedHandle` when an operator is blocked or waiting
//!   for memory, and resumes only after that handle resolves.
//! - Runs teardown exactly once: operators close in reverse order and every operator
//!   memory context is destroyed (normal finish) or released (cancel and failure).
//!
//! Key exported interfaces:
//! - Types: `Driver`, `DriverStep`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::blocked::{BlockedHandle, BlockedResolver};
use crate::exec::pipeline::driver_context::{DriverContext, DriverState};
use crate::exec::pipeline::operator::Operator;
use crate::exec::pipeline::operator_context::OperatorContext;
use crate::novaexec_logging::{debug, error};
use crate::runtime::thread_cpu_time::CallTimer;

#[derive(Clone, Debug)]
/// Result of one scheduling step.
///
/// ```text
///   process() ──► Ready ───────────── call again
///            ├──► Blocked(handle) ── call again once `handle` resolves
///            ├──► Finished
///            ├──► Canceled
///            └──► Failed(err)
/// ```
pub enum DriverStep {
    Ready,
    Blocked(BlockedHandle),
    Finished,
    Canceled,
    Failed(ExecError),
}

impl DriverStep {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverStep::Finished | DriverStep::Canceled | DriverStep::Failed(_)
        )
    }

    /// Handle view of the step: resolved unless the step is `Blocked`.
    pub fn handle(&self) -> BlockedHandle {
        match self {
            DriverStep::Blocked(handle) => handle.clone(),
            _ => BlockedHandle::not_blocked(),
        }
    }
}

struct DriverInner {
    operators: Vec<Box<dyn Operator>>,
    contexts: Vec<Arc<OperatorContext>>,
    finish_called: Vec<bool>,
    // Sticky: once an operator reports finished it is only closed.
    finished: Vec<bool>,
    blocked_ops: Vec<usize>,
    blocked_since: Option<Instant>,
    slice_start: Option<Instant>,
    made_progress: bool,
    outcome: Option<DriverStep>,
}

impl DriverInner {
    fn is_operator_finished(&mut self, idx: usize) -> bool {
        if !self.finished[idx] && self.operators[idx].is_finished() {
            self.finished[idx] = true;
        }
        self.finished[idx]
    }

    fn last_finished(&mut self) -> bool {
        let last = self.operators.len() - 1;
        self.is_operator_finished(last)
    }

    fn is_operator_blocked(&self, idx: usize) -> bool {
        (!self.finished[idx] && !self.operators[idx].is_blocked().is_resolved())
            || !self.contexts[idx].is_waiting_for_memory().is_resolved()
    }

    fn collect_blocked(&self) -> Vec<(usize, BlockedHandle)> {
        let mut blocked = Vec::new();
        for idx in 0..self.operators.len() {
            if !self.finished[idx] {
                let handle = self.operators[idx].is_blocked();
                if !handle.is_resolved() {
                    blocked.push((idx, handle));
                }
            }
            let memory = self.contexts[idx].is_waiting_for_memory();
            if !memory.is_resolved() {
                blocked.push((idx, memory));
            }
        }
        blocked
    }
}

/// Scheduler for one pipeline instance.
///
/// At most one thread is inside a step of a given driver; a concurrent caller returns
/// `DriverStep::Ready` immediately instead of waiting.
pub struct Driver {
    ctx: Arc<DriverContext>,
    inner: Mutex<DriverInner>,
    cancel_requested: AtomicBool,
    cancel_resolver: Mutex<Option<BlockedResolver>>,
    submitted: AtomicBool,
}

impl Driver {
    /// `operators[i]` must have been created with `ctx.operator_contexts()[i]`.
    pub fn new(ctx: Arc<DriverContext>, operators: Vec<Box<dyn Operator>>) -> ExecResult<Arc<Self>> {
        let contexts = ctx.operator_contexts();
        if operators.is_empty() {
            return Err(ExecError::InvalidArgument(
                "driver requires at least one operator".to_string(),
            ));
        }
        if operators.len() != contexts.len() {
            return Err(ExecError::InvalidArgument(format!(
                "driver {} has {} operators but {} operator contexts",
                ctx.driver_id(),
                operators.len(),
                contexts.len()
            )));
        }
        let num_operators = operators.len();
        Ok(Arc::new(Self {
            ctx,
            inner: Mutex::new(DriverInner {
                operators,
                contexts,
                finish_called: vec![false; num_operators],
                finished: vec![false; num_operators],
                blocked_ops: Vec::new(),
                blocked_since: None,
                slice_start: None,
                made_progress: false,
                outcome: None,
            }),
            cancel_requested: AtomicBool::new(false),
            cancel_resolver: Mutex::new(None),
            submitted: AtomicBool::new(false),
        }))
    }

    pub fn driver_context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    pub fn driver_id(&self) -> usize {
        self.ctx.driver_id()
    }

    pub fn state(&self) -> DriverState {
        self.ctx.state()
    }

    /// True once the terminal operator finished and teardown succeeded.
    pub fn is_finished(&self) -> bool {
        self.state() == DriverState::Finished
    }

    /// True in any terminal state.
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Request cancellation. A pending blocked handle returned by this driver resolves
    /// with a cancelled outcome; teardown happens on the next step.
    pub fn cancel(&self) {
        if self.cancel_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let resolver = self
            .cancel_resolver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(resolver) = resolver {
            resolver.cancel();
        }
    }

    /// Run one step.
    pub fn process(&self) -> DriverStep {
        self.run(None)
    }

    /// Run steps until the driver blocks, ends, stops making progress, or `time_slice` elapses.
    pub fn process_for(&self, time_slice: Duration) -> DriverStep {
        self.run(Some(time_slice))
    }

    pub(crate) fn try_mark_submitted(&self) -> bool {
        self.submitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Fail the driver from outside a step, e.g. after a panic escaped an operator call.
    pub(crate) fn abort(&self, err: ExecError) -> DriverStep {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(outcome) = &inner.outcome {
            return outcome.clone();
        }
        self.finish_with_state(&mut inner, DriverStep::Failed(err))
    }

    fn run(&self, time_slice: Option<Duration>) -> DriverStep {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return DriverStep::Ready,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };
        if let Some(outcome) = &inner.outcome {
            return outcome.clone();
        }
        let start = Instant::now();
        inner.slice_start = Some(start);
        self.close_blocked_interval(&mut inner);
        self.retire_cancel_resolver();
        let step = loop {
            let step = self.step(&mut inner);
            let keep_going = matches!(step, DriverStep::Ready)
                && inner.made_progress
                && time_slice.is_some_and(|slice| start.elapsed() < slice);
            if !keep_going {
                break step;
            }
        };
        if let Some(slice_start) = inner.slice_start.take() {
            self.ctx.record_processed(slice_start.elapsed());
        }
        step
    }

    fn step(&self, inner: &mut DriverInner) -> DriverStep {
        inner.made_progress = false;
        if self.cancel_requested.load(Ordering::Acquire) || self.ctx.task_context().is_aborted() {
            return self.finish_with_state(inner, DriverStep::Canceled);
        }
        if inner.last_finished() {
            return self.finish_with_state(inner, DriverStep::Finished);
        }
        self.ctx.set_state(DriverState::Running);

        let blocked = inner.collect_blocked();
        if !blocked.is_empty() {
            return self.block(inner, blocked);
        }

        let mut failure = None;
        for idx in 0..inner.operators.len() - 1 {
            if inner.is_operator_blocked(idx) {
                break;
            }
            let next_blocked = inner.is_operator_blocked(idx + 1);
            if let Err(err) = self.move_chunk(inner, idx, next_blocked) {
                failure = Some(err);
                break;
            }
        }
        if let Some(err) = failure {
            let step = if err.is_cancelled() {
                DriverStep::Canceled
            } else {
                DriverStep::Failed(err)
            };
            return self.finish_with_state(inner, step);
        }

        if inner.last_finished() {
            return self.finish_with_state(inner, DriverStep::Finished);
        }
        if !inner.made_progress {
            let blocked = inner.collect_blocked();
            if !blocked.is_empty() {
                return self.block(inner, blocked);
            }
        }
        DriverStep::Ready
    }

    /// Pull one chunk from operator `idx` into `idx + 1`, then propagate end of input.
    fn move_chunk(&self, inner: &mut DriverInner, idx: usize, next_blocked: bool) -> ExecResult<()> {
        let next = idx + 1;
        if inner.is_operator_finished(next) {
            return Ok(());
        }

        if !inner.is_operator_finished(idx) && !next_blocked && inner.operators[next].needs_input() {
            let timer = CallTimer::start();
            let output = inner.operators[idx].get_output();
            let (wall, cpu) = timer.stop();
            let output = output?;
            let sizes = output.as_ref().map(|c| (c.len(), c.estimated_bytes()));
            inner.contexts[idx].record_get_output(sizes, wall, cpu);
            if let (Some(chunk), Some((rows, bytes))) = (output, sizes) {
                let timer = CallTimer::start();
                let result = inner.operators[next].add_input(chunk);
                let (wall, cpu) = timer.stop();
                inner.contexts[next].record_add_input(rows, bytes, wall, cpu);
                result?;
                inner.made_progress = true;
            }
        }

        if !inner.finish_called[next]
            && inner.is_operator_finished(idx)
            && !inner.is_operator_finished(next)
            && inner.operators[next].needs_input()
        {
            inner.finish_called[next] = true;
            let timer = CallTimer::start();
            let result = inner.operators[next].finish();
            let (wall, cpu) = timer.stop();
            inner.contexts[next].record_finish(wall, cpu);
            result?;
            inner.made_progress = true;
        }
        Ok(())
    }

    fn block(&self, inner: &mut DriverInner, blocked: Vec<(usize, BlockedHandle)>) -> DriverStep {
        let driver_id = self.ctx.driver_id();
        let (cancel_handle, cancel_resolver) =
            BlockedHandle::pending(format!("driver-{driver_id}-cancel"));
        *self
            .cancel_resolver
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(cancel_resolver.clone());
        if self.cancel_requested.load(Ordering::Acquire) {
            cancel_resolver.cancel();
        }
        self.ctx
            .task_context()
            .register_cancellable(cancel_resolver);

        let mut handles: Vec<BlockedHandle> = Vec::with_capacity(blocked.len() + 1);
        let mut blocked_ops: Vec<usize> = Vec::with_capacity(blocked.len());
        for (idx, handle) in blocked {
            debug!(
                "Driver blocked: driver_id={} op={} handle={}",
                driver_id,
                inner.operators[idx].name(),
                handle.name()
            );
            handles.push(handle);
            blocked_ops.push(idx);
        }
        blocked_ops.dedup();
        for idx in &blocked_ops {
            inner.contexts[*idx].record_blocked(true, Duration::ZERO);
        }
        inner.blocked_ops = blocked_ops;
        inner.blocked_since = Some(Instant::now());
        handles.push(cancel_handle);

        self.ctx.set_state(DriverState::Blocked);
        DriverStep::Blocked(BlockedHandle::any(format!("driver-{driver_id}"), &handles))
    }

    /// Resolve the cancel handle of the previous block. The task then drops it from its
    /// cancellables instead of keeping one entry per block for its whole lifetime.
    fn retire_cancel_resolver(&self) {
        let resolver = self
            .cancel_resolver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(resolver) = resolver {
            resolver.resolve();
        }
    }

    fn close_blocked_interval(&self, inner: &mut DriverInner) {
        let Some(since) = inner.blocked_since.take() else {
            return;
        };
        let wall = since.elapsed();
        for idx in std::mem::take(&mut inner.blocked_ops) {
            inner.contexts[idx].record_blocked(false, wall);
        }
    }

    fn finish_with_state(&self, inner: &mut DriverInner, step: DriverStep) -> DriverStep {
        let driver_id = self.ctx.driver_id();
        let mut step = step;
        self.close_blocked_interval(inner);

        for idx in (0..inner.operators.len()).rev() {
            let op = &mut inner.operators[idx];
            if let Err(err) = op.close() {
                error!(
                    "operator close failed: driver_id={} op={} error={}",
                    driver_id,
                    op.name(),
                    err
                );
                if matches!(step, DriverStep::Finished) {
                    step = DriverStep::Failed(err);
                }
            }
        }

        if matches!(step, DriverStep::Finished) {
            for ctx in &inner.contexts {
                if let Err(err) = ctx.destroy() {
                    step = DriverStep::Failed(err);
                    break;
                }
            }
        }
        if !matches!(step, DriverStep::Finished) {
            for ctx in &inner.contexts {
                match ctx.release_all() {
                    Ok(0) => {}
                    Ok(released) => debug!(
                        "Driver released memory: driver_id={} op={} bytes={}",
                        driver_id,
                        ctx.operator_type(),
                        released
                    ),
                    Err(err) => error!(
                        "Driver failed to release memory: driver_id={} op={} error={}",
                        driver_id,
                        ctx.operator_type(),
                        err
                    ),
                }
            }
        }

        self.retire_cancel_resolver();
        if let Some(slice_start) = inner.slice_start.take() {
            self.ctx.record_processed(slice_start.elapsed());
        }

        match &step {
            DriverStep::Finished => {
                let last_op = inner.operators.last().map(|op| op.name()).unwrap_or("unknown");
                debug!("Driver finished: driver_id={} last_op={}", driver_id, last_op);
                self.ctx.set_state(DriverState::Finished);
            }
            DriverStep::Canceled => {
                debug!("Driver canceled: driver_id={}", driver_id);
                self.ctx.set_state(DriverState::Canceled);
                // A task cannot finish with a cancelled driver.
                self.ctx.task_context().cancel();
            }
            DriverStep::Failed(err) => {
                error!("Driver failed: driver_id={} error={}", driver_id, err);
                self.ctx.set_state(DriverState::Failed);
                self.ctx.task_context().fail(err.clone());
            }
            DriverStep::Ready | DriverStep::Blocked(_) => {}
        }
        self.ctx.report_final_stats();
        inner.outcome = Some(step.clone());
        step
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if inner.outcome.is_some() {
            return;
        }
        for op in inner.operators.iter_mut().rev() {
            if let Err(err) = op.close() {
                error!("operator close failed on drop: op={} error={}", op.name(), err);
            }
        }
        for ctx in &inner.contexts {
            if let Err(err) = ctx.release_all() {
                error!(
                    "Driver failed to release memory on drop: driver_id={} error={}",
                    self.ctx.driver_id(),
                    err
                );
            }
        }
        self.ctx.set_state(DriverState::Canceled);
        self.ctx.report_final_stats();
    }
}
