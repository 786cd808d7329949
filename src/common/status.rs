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
//! Execution error taxonomy.
//!
//! Responsibilities:
//! - Distinguishes resource-limit, accounting, operator, and cancellation failures.
//! - Carries enough context for the task boundary to decide between failing and cancelling.
//!
//! Key exported interfaces:
//! - Types: `ExecError`, `MemoryKind`, `ExecResult`.

use std::fmt;

use thiserror::Error;

use crate::common::types::UniqueId;

/// Result alias used across the execution runtime.
pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Which accounting ledger a reservation is charged to, or which query cap it breached.
pub enum MemoryKind {
    User,
    System,
    /// User plus system memory of one query.
    Total,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::User => f.write_str("user"),
            MemoryKind::System => f.write_str("system"),
            MemoryKind::Total => f.write_str("total"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    /// A query-level memory cap would be exceeded. Fatal to the query.
    #[error(
        "Query {query_id} exceeded local {kind} memory limit of {limit_bytes} bytes \
         (reserved={reserved_bytes}, requested={requested_bytes})"
    )]
    ExceededMemoryLimit {
        query_id: UniqueId,
        kind: MemoryKind,
        limit_bytes: i64,
        reserved_bytes: i64,
        requested_bytes: i64,
    },

    /// Broken reserve/free bookkeeping. Always a bug in the caller.
    #[error("memory accounting violation: {0}")]
    AccountingViolation(String),

    /// An operator call returned an error.
    #[error("operator {operator} failed: {message}")]
    Operator { operator: String, message: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn operator(operator: impl Into<String>, message: impl Into<String>) -> Self {
        ExecError::Operator {
            operator: operator.into(),
            message: message.into(),
        }
    }

    pub fn is_resource_limit(&self) -> bool {
        matches!(self, ExecError::ExceededMemoryLimit { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled(_))
    }

    pub fn is_accounting_violation(&self) -> bool {
        matches!(self, ExecError::AccountingViolation(_))
    }
}
