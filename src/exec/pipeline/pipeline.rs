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
//! Pipeline structure metadata.
//!
//! Responsibilities:
//! - Represents one pipeline as an ordered list of operator factories.
//! - Instantiates one operator chain per driver, each with its own memory contexts.
//!
//! Key exported interfaces:
//! - Types: `Pipeline`.

use std::sync::Arc;

use super::driver::Driver;
use super::operator_factory::OperatorFactory;
use crate::common::status::{ExecError, ExecResult};
use crate::novaexec_logging::debug;
use crate::runtime::task_context::TaskContext;

/// One pipeline definition: factories from source to sink plus its degree of parallelism.
pub struct Pipeline {
    id: i32,
    op_factories: Vec<Arc<dyn OperatorFactory>>,
    dop: usize,
}

impl Pipeline {
    pub fn new(id: i32, op_factories: Vec<Arc<dyn OperatorFactory>>, dop: usize) -> ExecResult<Self> {
        if op_factories.is_empty() {
            return Err(ExecError::InvalidArgument(format!(
                "pipeline {id} has no operators"
            )));
        }
        Ok(Self {
            id,
            op_factories,
            dop: dop.max(1),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn dop(&self) -> usize {
        self.dop
    }

    pub fn operator_names(&self) -> Vec<&str> {
        self.op_factories.iter().map(|f| f.name()).collect()
    }

    pub fn instantiate_drivers(&self, task: &Arc<TaskContext>) -> ExecResult<Vec<Arc<Driver>>> {
        let mut drivers = Vec::with_capacity(self.dop);
        for _ in 0..self.dop {
            let driver_ctx = task.add_driver_context(self.id);
            let mut operators = Vec::with_capacity(self.op_factories.len());
            for factory in &self.op_factories {
                let op_ctx = driver_ctx.add_operator_context(factory.operator_id(), factory.name());
                operators.push(factory.create(op_ctx)?);
            }
            debug!(
                "Pipeline driver created: pipeline_id={} driver_id={} operators={:?}",
                self.id,
                driver_ctx.driver_id(),
                self.operator_names()
            );
            drivers.push(Driver::new(driver_ctx, operators)?);
        }
        Ok(drivers)
    }
}
