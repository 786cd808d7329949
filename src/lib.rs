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
pub mod common;
pub mod exec;
pub mod runtime;

// Short aliases for the config and logging modules.
pub use common::app_config as novaexec_config;
pub use common::logging as novaexec_logging;

pub use common::status::{ExecError, ExecResult};
pub use common::types::{QueryId, TaskId, UniqueId};
pub use exec::chunk::Chunk;
pub use exec::pipeline::blocked::{BlockedHandle, BlockedOutcome, BlockedResolver};
pub use exec::pipeline::driver::{Driver, DriverStep};
pub use exec::pipeline::global_driver_executor::DriverExecutor;
pub use exec::pipeline::operator::Operator;
pub use exec::pipeline::operator_factory::OperatorFactory;
pub use exec::pipeline::pipeline::Pipeline;
pub use exec::pipeline::task_execution::TaskExecution;
pub use runtime::memory_pool::{MemoryPool, MemoryPoolId};
pub use runtime::query_context::{QueryContext, QueryMemoryLimits};
pub use runtime::task_context::{TaskContext, TaskState};
