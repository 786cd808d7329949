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
//! Process-wide memory pools.
//!
//! Responsibilities:
//! - Builds the user ("general") and system pools from configuration.
//! - Hands shared pool references to query contexts.
//!
//! Key exported interfaces:
//! - Types: `LocalMemoryManager`.
//! - Constants: `GENERAL_POOL`, `SYSTEM_POOL`.

use std::sync::Arc;

use crate::common::app_config::PoolConfig;
use crate::runtime::memory_pool::{MemoryPool, MemoryPoolId};

pub const GENERAL_POOL: &str = "general";
pub const SYSTEM_POOL: &str = "system";

#[derive(Debug, Clone)]
pub struct LocalMemoryManager {
    general: Arc<MemoryPool>,
    system: Arc<MemoryPool>,
}

impl LocalMemoryManager {
    pub fn new(user_capacity_bytes: i64, system_capacity_bytes: i64) -> Self {
        Self {
            general: Arc::new(MemoryPool::new(
                MemoryPoolId::new(GENERAL_POOL),
                user_capacity_bytes,
            )),
            system: Arc::new(MemoryPool::new(
                MemoryPoolId::new(SYSTEM_POOL),
                system_capacity_bytes,
            )),
        }
    }

    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self::new(cfg.capacity_bytes, cfg.system_capacity_bytes)
    }

    pub fn general_pool(&self) -> Arc<MemoryPool> {
        Arc::clone(&self.general)
    }

    pub fn system_pool(&self) -> Arc<MemoryPool> {
        Arc::clone(&self.system)
    }

    pub fn pool(&self, id: &MemoryPoolId) -> Option<Arc<MemoryPool>> {
        match id.as_str() {
            GENERAL_POOL => Some(self.general_pool()),
            SYSTEM_POOL => Some(self.system_pool()),
            _ => None,
        }
    }
}
