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
//! Core operator trait and its non-blocking lifecycle.
//!
//! Responsibilities:
//! - Defines the push/pull contract a driver relies on to move chunks along a pipeline.
//! - Lets an operator express "cannot progress now" as a `BlockedHandle` instead of
//!   blocking the worker thread.
//!
//! Key exported interfaces:
//! - Types: `Operator`.
//!
//! Every method must return after a small bounded amount of work. An operator that
//! would have to wait reports it through `is_blocked` and does nothing else.

use crate::common::status::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::blocked::BlockedHandle;

/// Operator contract driven by a [`Driver`](crate::exec::pipeline::driver::Driver).
///
/// Lifecycle per operator: accepts input while `needs_input` is true, produces output
/// through `get_output`, is told there is no more input with `finish`, drains, and then
/// reports `is_finished`. After `is_finished` returns true the driver never calls the
/// operator again except `close`.
pub trait Operator: Send {
    fn name(&self) -> &str;

    /// Already-resolved handle when the operator can make progress.
    fn is_blocked(&self) -> BlockedHandle {
        BlockedHandle::not_blocked()
    }

    fn needs_input(&self) -> bool;

    /// Only called while `needs_input` is true.
    fn add_input(&mut self, chunk: Chunk) -> ExecResult<()>;

    fn get_output(&mut self) -> ExecResult<Option<Chunk>>;

    /// No more input will arrive. Buffered state drains through later `get_output` calls.
    fn finish(&mut self) -> ExecResult<()>;

    fn is_finished(&self) -> bool;

    /// Release operator-held resources, including any memory still reserved in its context.
    fn close(&mut self) -> ExecResult<()> {
        Ok(())
    }
}
