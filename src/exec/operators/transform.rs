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
//! Chunk-at-a-time transform operator.
//!
//! Responsibilities:
//! - Applies a fallible per-chunk function, buffering at most one output chunk.
//! - Provides a row filter built on Arrow's `filter_record_batch`.
//!
//! Key exported interfaces:
//! - Types: `ChunkTransformFactory`, `TransformFn`.

use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;

use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::Operator;
use crate::exec::pipeline::operator_context::OperatorContext;
use crate::exec::pipeline::operator_factory::OperatorFactory;

/// Per-chunk function. `Ok(None)` drops the chunk.
pub type TransformFn = Arc<dyn Fn(Chunk) -> ExecResult<Option<Chunk>> + Send + Sync>;

pub struct ChunkTransformFactory {
    name: String,
    operator_id: i32,
    transform: TransformFn,
}

impl ChunkTransformFactory {
    pub fn new(operator_id: i32, label: &str, transform: TransformFn) -> Self {
        Self {
            name: format!("{label} (id={operator_id})"),
            operator_id,
            transform,
        }
    }

    /// Keep the rows for which `predicate` yields true. Null counts as false.
    pub fn filter<P>(operator_id: i32, predicate: P) -> Self
    where
        P: Fn(&Chunk) -> ExecResult<BooleanArray> + Send + Sync + 'static,
    {
        let name = format!("FILTER (id={operator_id})");
        let op_name = name.clone();
        let transform: TransformFn = Arc::new(move |chunk: Chunk| {
            let mask = predicate(&chunk)?;
            if mask.len() != chunk.len() {
                return Err(ExecError::operator(
                    op_name.clone(),
                    format!(
                        "filter mask has {} rows but chunk has {}",
                        mask.len(),
                        chunk.len()
                    ),
                ));
            }
            let batch = filter_record_batch(&chunk.batch, &mask)
                .map_err(|e| ExecError::operator(op_name.clone(), e.to_string()))?;
            Ok(Some(Chunk::new(batch)))
        });
        Self {
            name,
            operator_id,
            transform,
        }
    }
}

impl OperatorFactory for ChunkTransformFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn operator_id(&self) -> i32 {
        self.operator_id
    }

    fn create(&self, _ctx: Arc<OperatorContext>) -> ExecResult<Box<dyn Operator>> {
        Ok(Box::new(ChunkTransformOperator {
            name: self.name.clone(),
            transform: Arc::clone(&self.transform),
            pending_output: None,
            finishing: false,
            finished: false,
        }))
    }
}

struct ChunkTransformOperator {
    name: String,
    transform: TransformFn,
    pending_output: Option<Chunk>,
    finishing: bool,
    finished: bool,
}

impl Operator for ChunkTransformOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_input(&self) -> bool {
        !self.finishing && self.pending_output.is_none()
    }

    fn add_input(&mut self, chunk: Chunk) -> ExecResult<()> {
        if self.pending_output.is_some() {
            return Err(ExecError::operator(
                self.name.clone(),
                "received input while output buffer is full",
            ));
        }
        self.pending_output = (self.transform)(chunk)?.filter(|c| !c.is_empty());
        Ok(())
    }

    fn get_output(&mut self) -> ExecResult<Option<Chunk>> {
        let out = self.pending_output.take();
        if self.finishing {
            self.finished = true;
        }
        Ok(out)
    }

    fn finish(&mut self) -> ExecResult<()> {
        self.finishing = true;
        if self.pending_output.is_none() {
            self.finished = true;
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
