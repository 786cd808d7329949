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
//! Fixed-list source operator.
//!
//! Responsibilities:
//! - Emits a fixed list of chunks, one per `get_output` call, then finishes.
//! - Spreads the chunks round-robin over the driver instances of its pipeline.
//!
//! Key exported interfaces:
//! - Types: `ValuesSourceFactory`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::Operator;
use crate::exec::pipeline::operator_context::OperatorContext;
use crate::exec::pipeline::operator_factory::OperatorFactory;

/// Factory for sources that emit a fixed list of chunks.
pub struct ValuesSourceFactory {
    name: String,
    operator_id: i32,
    chunks: Vec<Chunk>,
    dop: usize,
    instances: AtomicUsize,
}

impl ValuesSourceFactory {
    pub fn new(operator_id: i32, chunks: Vec<Chunk>) -> Self {
        Self {
            name: format!("ValuesSource (id={operator_id})"),
            operator_id,
            chunks,
            dop: 1,
            instances: AtomicUsize::new(0),
        }
    }

    /// Split the chunks across `dop` instances: instance `k` emits chunks `k, k + dop, ...`.
    pub fn with_parallelism(mut self, dop: usize) -> Self {
        self.dop = dop.max(1);
        self
    }
}

impl OperatorFactory for ValuesSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn operator_id(&self) -> i32 {
        self.operator_id
    }

    fn create(&self, _ctx: Arc<OperatorContext>) -> ExecResult<Box<dyn Operator>> {
        let instance = self.instances.fetch_add(1, Ordering::Relaxed) % self.dop;
        let chunks = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(idx, _)| idx % self.dop == instance)
            .map(|(_, chunk)| chunk.clone())
            .collect();
        Ok(Box::new(ValuesSourceOperator {
            name: self.name.clone(),
            chunks,
        }))
    }
}

struct ValuesSourceOperator {
    name: String,
    chunks: VecDeque<Chunk>,
}

impl Operator for ValuesSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, _chunk: Chunk) -> ExecResult<()> {
        Err(ExecError::operator(
            self.name.clone(),
            "values source does not accept input",
        ))
    }

    fn get_output(&mut self) -> ExecResult<Option<Chunk>> {
        Ok(self.chunks.pop_front())
    }

    fn finish(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.chunks.is_empty()
    }
}
