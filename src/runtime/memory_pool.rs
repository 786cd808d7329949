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
//! Capacity-bounded memory pool shared by every query on this process.
//!
//! Responsibilities:
//! - Keeps the per-query reservation ledger and the pool total under one lock.
//! - Records over-capacity reservations and hands the caller a pending `BlockedHandle`
//!   that resolves once a later free brings the pool back under capacity.
//!
//! Key exported interfaces:
//! - Types: `MemoryPool`, `MemoryPoolId`, `MemoryPoolInfo`.
//!
//! Free bytes may go negative: work that was already admitted keeps running past the
//! ceiling, and the pool applies backpressure by keeping its blocked handle pending.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::common::status::{ExecError, ExecResult};
use crate::common::types::QueryId;
use crate::exec::pipeline::blocked::{BlockedHandle, BlockedResolver};
use crate::novaexec_logging::{debug, error, info};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryPoolId(String);

impl MemoryPoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryPoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time view of a pool, for reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPoolInfo {
    pub id: MemoryPoolId,
    pub max_bytes: i64,
    pub reserved_bytes: i64,
    pub free_bytes: i64,
    /// Keyed by the query id rendered as a uuid string.
    pub query_reservations: HashMap<String, i64>,
}

struct PoolState {
    reserved_bytes: i64,
    query_reservations: HashMap<QueryId, i64>,
    // Present only while free bytes <= 0.
    blocked: Option<(BlockedHandle, BlockedResolver)>,
}

pub struct MemoryPool {
    id: MemoryPoolId,
    max_bytes: i64,
    state: Mutex<PoolState>,
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("id", &self.id)
            .field("max_bytes", &self.max_bytes)
            .field("reserved_bytes", &self.reserved_bytes())
            .finish()
    }
}

fn check_bytes(op: &str, bytes: i64) -> ExecResult<()> {
    if bytes < 0 {
        return Err(ExecError::InvalidArgument(format!(
            "{op} bytes is negative: {bytes}"
        )));
    }
    Ok(())
}

impl PoolState {
    fn blocked_handle(&mut self, pool: &MemoryPoolId) -> BlockedHandle {
        match &self.blocked {
            Some((handle, _)) => handle.clone(),
            None => {
                let (handle, resolver) = BlockedHandle::pending(format!("memory_pool:{pool}"));
                self.blocked = Some((handle.clone(), resolver));
                handle
            }
        }
    }
}

impl MemoryPool {
    pub fn new(id: MemoryPoolId, max_bytes: i64) -> Self {
        Self {
            id,
            max_bytes,
            state: Mutex::new(PoolState {
                reserved_bytes: 0,
                query_reservations: HashMap::new(),
                blocked: None,
            }),
        }
    }

    pub fn id(&self) -> &MemoryPoolId {
        &self.id
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes
    }

    /// Record `bytes` for `query_id` unconditionally.
    ///
    /// Returns an already-resolved handle while the pool has free bytes left after the
    /// reservation, otherwise the pool's shared pending handle. Resolution only means the
    /// pool dropped back under capacity; callers re-check and may block again.
    pub fn reserve(&self, query_id: QueryId, bytes: i64) -> ExecResult<BlockedHandle> {
        check_bytes("reserve", bytes)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if bytes > 0 {
            *state.query_reservations.entry(query_id).or_insert(0) += bytes;
            state.reserved_bytes += bytes;
        }
        let free_bytes = self.max_bytes - state.reserved_bytes;
        if free_bytes > 0 {
            return Ok(BlockedHandle::not_blocked());
        }
        if state.blocked.is_none() {
            info!(
                "memory pool {} over capacity: reserved={} max={} query={} requested={}",
                self.id, state.reserved_bytes, self.max_bytes, query_id, bytes
            );
        }
        Ok(state.blocked_handle(&self.id))
    }

    /// Record `bytes` only if they fit. Never blocks and never pushes the pool over capacity.
    pub fn try_reserve(&self, query_id: QueryId, bytes: i64) -> ExecResult<bool> {
        check_bytes("try_reserve", bytes)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.max_bytes - state.reserved_bytes - bytes < 0 {
            return Ok(false);
        }
        if bytes > 0 {
            *state.query_reservations.entry(query_id).or_insert(0) += bytes;
            state.reserved_bytes += bytes;
        }
        Ok(true)
    }

    /// Release `bytes` previously reserved by `query_id`.
    ///
    /// Freeing more than the query holds is an accounting violation and leaves the ledger
    /// untouched. When the pool drops back under capacity every waiter is woken.
    pub fn free(&self, query_id: QueryId, bytes: i64) -> ExecResult<()> {
        check_bytes("free", bytes)?;
        if bytes == 0 {
            return Ok(());
        }
        let resolver = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let held = state.query_reservations.get(&query_id).copied().unwrap_or(0);
            if bytes > held {
                error!(
                    "memory pool {} over-free: query={} free={} reserved={}",
                    self.id, query_id, bytes, held
                );
                return Err(ExecError::AccountingViolation(format!(
                    "pool {}: query {} freed {} bytes but holds {}",
                    self.id, query_id, bytes, held
                )));
            }
            if held == bytes {
                state.query_reservations.remove(&query_id);
            } else {
                state.query_reservations.insert(query_id, held - bytes);
            }
            state.reserved_bytes -= bytes;
            if self.max_bytes - state.reserved_bytes > 0 {
                state.blocked.take().map(|(_, resolver)| resolver)
            } else {
                None
            }
        };
        if let Some(resolver) = resolver {
            debug!(
                "memory pool {} back under capacity after query {} freed {} bytes",
                self.id, query_id, bytes
            );
            resolver.resolve();
        }
        Ok(())
    }

    pub fn free_bytes(&self) -> i64 {
        self.max_bytes - self.reserved_bytes()
    }

    pub fn reserved_bytes(&self) -> i64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reserved_bytes
    }

    pub fn query_reservation(&self, query_id: QueryId) -> i64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .query_reservations
            .get(&query_id)
            .copied()
            .unwrap_or(0)
    }

    /// Resolved while the pool has free bytes, otherwise the shared pending handle.
    pub fn blocked_handle(&self) -> BlockedHandle {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.max_bytes - state.reserved_bytes > 0 {
            return BlockedHandle::not_blocked();
        }
        state.blocked_handle(&self.id)
    }

    pub fn info(&self) -> MemoryPoolInfo {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        MemoryPoolInfo {
            id: self.id.clone(),
            max_bytes: self.max_bytes,
            reserved_bytes: state.reserved_bytes,
            free_bytes: self.max_bytes - state.reserved_bytes,
            query_reservations: state
                .query_reservations
                .iter()
                .map(|(query_id, bytes)| (query_id.to_string(), *bytes))
                .collect(),
        }
    }
}
