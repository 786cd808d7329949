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
//! Collecting sink operator.
//!
//! Responsibilities:
//! - Hands every input chunk to a shared `ResultCollector`.
//! - Reserves the estimated bytes of retained chunks through its operator context, so a
//!   full memory pool throttles the pipeline feeding it.
//!
//! Key exported interfaces:
//! - Types: `CollectSinkFactory`, `ResultCollector`.

use std::sync::{Arc, Mutex};

use crate::common::status::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::Operator;
use crate::exec::pipeline::operator_context::OperatorContext;
use crate::exec::pipeline::operator_factory::OperatorFactory;

#[derive(Default)]
struct CollectorState {
    chunks: Vec<Chunk>,
    num_rows: usize,
    finished_sinks: usize,
}

/// Result chunks delivered by one or more sink instances.
#[derive(Default)]
pub struct ResultCollector {
    state: Mutex<CollectorState>,
}

impl ResultCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, chunk: Chunk) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.num_rows += chunk.len();
        state.chunks.push(chunk);
    }

    fn sink_finished(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished_sinks += 1;
    }

    pub fn num_chunks(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .chunks
            .len()
    }

    pub fn num_rows(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .num_rows
    }

    /// Number of sink instances that received `finish`.
    pub fn finished_sinks(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finished_sinks
    }

    pub fn take_chunks(&self) -> Vec<Chunk> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.num_rows = 0;
        std::mem::take(&mut state.chunks)
    }
}

pub struct CollectSinkFactory {
    name: String,
    operator_id: i32,
    collector: Arc<ResultCollector>,
}

impl CollectSinkFactory {
    pub fn new(operator_id: i32, collector: Arc<ResultCollector>) -> Self {
        Self {
            name: format!("CollectSink (id={operator_id})"),
            operator_id,
            collector,
        }
    }
}

impl OperatorFactory for CollectSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn operator_id(&self) -> i32 {
        self.operator_id
    }

    fn create(&self, ctx: Arc<OperatorContext>) -> ExecResult<Box<dyn Operator>> {
        Ok(Box::new(CollectSinkOperator {
            name: self.name.clone(),
            ctx,
            collector: Arc::clone(&self.collector),
            finished: false,
        }))
    }
}

struct CollectSinkOperator {
    name: String,
    ctx: Arc<OperatorContext>,
    collector: Arc<ResultCollector>,
    finished: bool,
}

impl Operator for CollectSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_input(&self) -> bool {
        !self.finished
    }

    fn add_input(&mut self, chunk: Chunk) -> ExecResult<()> {
        let bytes = i64::try_from(chunk.estimated_bytes()).unwrap_or(i64::MAX);
        // A pending handle is picked up by the driver through the operator context.
        self.ctx.reserve(bytes)?;
        self.collector.push(chunk);
        Ok(())
    }

    fn get_output(&mut self) -> ExecResult<Option<Chunk>> {
        Ok(None)
    }

    fn finish(&mut self) -> ExecResult<()> {
        if !self.finished {
            self.finished = true;
            self.collector.sink_finished();
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    /// Retained chunks now belong to the collector's owner.
    fn close(&mut self) -> ExecResult<()> {
        let reserved = self.ctx.reserved_bytes();
        if reserved > 0 {
            self.ctx.free(reserved)?;
        }
        Ok(())
    }
}
