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
//! Process-wide execution environment.
//!
//! Responsibilities:
//! - Builds the memory pools, the query registry and the driver executor from one config.
//!
//! Key exported interfaces:
//! - Types: `ExecEnv`.
//! - Functions: `exec_env`.

use std::sync::OnceLock;

use crate::common::app_config::{self, NovaExecConfig};
use crate::exec::pipeline::global_driver_executor::DriverExecutor;
use crate::novaexec_logging::{self, warn};
use crate::runtime::memory_manager::LocalMemoryManager;
use crate::runtime::query_context::{QueryContextManager, QueryMemoryLimits};

pub struct ExecEnv {
    query_manager: QueryContextManager,
    executor: DriverExecutor,
}

impl ExecEnv {
    pub fn new(cfg: &NovaExecConfig) -> Self {
        let memory_manager = LocalMemoryManager::from_config(&cfg.pool);
        Self {
            query_manager: QueryContextManager::new(
                memory_manager,
                QueryMemoryLimits::from(&cfg.query),
            ),
            executor: DriverExecutor::from_config(&cfg.runtime),
        }
    }

    pub fn memory_manager(&self) -> &LocalMemoryManager {
        self.query_manager.memory_manager()
    }

    pub fn query_manager(&self) -> &QueryContextManager {
        &self.query_manager
    }

    pub fn executor(&self) -> &DriverExecutor {
        &self.executor
    }
}

static EXEC_ENV: OnceLock<ExecEnv> = OnceLock::new();

/// Process-wide environment, built from the loaded config or defaults.
///
/// The first call also installs logging at the configured level.
pub fn exec_env() -> &'static ExecEnv {
    EXEC_ENV.get_or_init(|| match app_config::config() {
        Ok(cfg) => {
            novaexec_logging::init_from_config(cfg);
            ExecEnv::new(cfg)
        }
        Err(err) => {
            let cfg = NovaExecConfig::default();
            novaexec_logging::init_from_config(&cfg);
            warn!("exec env falls back to default config: {}", err);
            ExecEnv::new(&cfg)
        }
    })
}
