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
//! Operator factory trait definitions.
//!
//! Responsibilities:
//! - Separates plan-time operator configuration from the runtime instances each driver owns.
//!
//! Key exported interfaces:
//! - Types: `OperatorFactory`.

use std::sync::Arc;

use super::operator::Operator;
use crate::common::status::ExecResult;
use crate::exec::pipeline::operator_context::OperatorContext;

/// Builds one operator instance per driver of a pipeline.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Plan node id; operators of the same factory share it and their stats merge under it.
    fn operator_id(&self) -> i32;

    fn create(&self, ctx: Arc<OperatorContext>) -> ExecResult<Box<dyn Operator>>;
}
