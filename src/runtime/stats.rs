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
//! Read-only execution counters.
//!
//! Responsibilities:
//! - Snapshots of per-operator, per-driver and per-task counters for external reporting.
//! - Additive merge across operators of the same plan node, so totals stay consistent
//!   whichever order drivers finish in.
//!
//! Key exported interfaces:
//! - Types: `OperatorStats`, `DriverStats`, `TaskStats`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::types::TaskId;
use crate::exec::pipeline::driver_context::DriverState;
use crate::runtime::task_context::TaskState;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub operator_id: i32,
    pub operator_type: String,

    pub add_input_calls: u64,
    pub add_input_wall_nanos: u64,
    pub add_input_cpu_nanos: u64,
    pub input_bytes: u64,
    pub input_rows: u64,

    pub get_output_calls: u64,
    pub get_output_wall_nanos: u64,
    pub get_output_cpu_nanos: u64,
    pub output_bytes: u64,
    pub output_rows: u64,

    pub blocked_wall_nanos: u64,

    pub finish_calls: u64,
    pub finish_wall_nanos: u64,
    pub finish_cpu_nanos: u64,

    pub memory_reservation_bytes: i64,
    pub system_memory_reservation_bytes: i64,
    pub peak_memory_reservation_bytes: i64,
    pub blocked: bool,
}

impl OperatorStats {
    pub fn new(operator_id: i32, operator_type: impl Into<String>) -> Self {
        Self {
            operator_id,
            operator_type: operator_type.into(),
            ..Default::default()
        }
    }

    /// Sum `self` with `others`. Identity comes from `self`; the peak is the largest
    /// peak seen and the blocked flag is set if any input was blocked.
    pub fn add(&self, others: &[OperatorStats]) -> OperatorStats {
        let mut out = self.clone();
        for other in others {
            out.add_input_calls += other.add_input_calls;
            out.add_input_wall_nanos += other.add_input_wall_nanos;
            out.add_input_cpu_nanos += other.add_input_cpu_nanos;
            out.input_bytes += other.input_bytes;
            out.input_rows += other.input_rows;

            out.get_output_calls += other.get_output_calls;
            out.get_output_wall_nanos += other.get_output_wall_nanos;
            out.get_output_cpu_nanos += other.get_output_cpu_nanos;
            out.output_bytes += other.output_bytes;
            out.output_rows += other.output_rows;

            out.blocked_wall_nanos += other.blocked_wall_nanos;

            out.finish_calls += other.finish_calls;
            out.finish_wall_nanos += other.finish_wall_nanos;
            out.finish_cpu_nanos += other.finish_cpu_nanos;

            out.memory_reservation_bytes += other.memory_reservation_bytes;
            out.system_memory_reservation_bytes += other.system_memory_reservation_bytes;
            out.peak_memory_reservation_bytes = out
                .peak_memory_reservation_bytes
                .max(other.peak_memory_reservation_bytes);
            out.blocked |= other.blocked;
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStats {
    pub driver_id: usize,
    pub pipeline_id: i32,
    pub state: DriverState,
    pub elapsed_wall_nanos: u64,
    pub processed_wall_nanos: u64,
    pub blocked_wall_nanos: u64,
    pub operators: Vec<OperatorStats>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub task_id: TaskId,
    pub state: TaskState,
    pub memory_reservation_bytes: i64,
    pub system_memory_reservation_bytes: i64,
    pub total_drivers: usize,
    pub queued_drivers: usize,
    pub running_drivers: usize,
    pub blocked_drivers: usize,
    pub completed_drivers: usize,
    pub operator_summaries: Vec<OperatorStats>,
}

/// Merge operator stats of the same operator id across drivers, ordered by id.
pub fn summarize_operators<'a, I>(drivers: I) -> Vec<OperatorStats>
where
    I: IntoIterator<Item = &'a DriverStats>,
{
    let mut by_id: BTreeMap<i32, Vec<OperatorStats>> = BTreeMap::new();
    for driver in drivers {
        for op in &driver.operators {
            by_id.entry(op.operator_id).or_default().push(op.clone());
        }
    }
    by_id
        .into_values()
        .filter_map(|mut group| {
            if group.is_empty() {
                return None;
            }
            let first = group.remove(0);
            Some(first.add(&group))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OperatorStats {
        OperatorStats {
            operator_id: 41,
            operator_type: "test".to_string(),
            add_input_calls: 1,
            add_input_wall_nanos: 2,
            add_input_cpu_nanos: 3,
            input_bytes: 5,
            input_rows: 6,
            get_output_calls: 7,
            get_output_wall_nanos: 8,
            get_output_cpu_nanos: 9,
            output_bytes: 11,
            output_rows: 12,
            blocked_wall_nanos: 13,
            finish_calls: 14,
            finish_wall_nanos: 15,
            finish_cpu_nanos: 16,
            memory_reservation_bytes: 18,
            system_memory_reservation_bytes: 19,
            peak_memory_reservation_bytes: 20,
            blocked: false,
        }
    }

    #[test]
    fn add_sums_counters_and_keeps_identity() {
        let base = sample();
        let mut blocked = sample();
        blocked.blocked = true;
        blocked.peak_memory_reservation_bytes = 50;
        let merged = base.add(&[base.clone(), blocked]);
        assert_eq!(merged.operator_id, 41);
        assert_eq!(merged.operator_type, "test");
        assert_eq!(merged.add_input_calls, 3);
        assert_eq!(merged.input_rows, 18);
        assert_eq!(merged.get_output_cpu_nanos, 27);
        assert_eq!(merged.blocked_wall_nanos, 39);
        assert_eq!(merged.finish_calls, 42);
        assert_eq!(merged.memory_reservation_bytes, 54);
        assert_eq!(merged.system_memory_reservation_bytes, 57);
        assert_eq!(merged.peak_memory_reservation_bytes, 50);
        assert!(merged.blocked);
    }

    #[test]
    fn summarize_groups_by_operator_id() {
        let mut other = OperatorStats::new(2, "sink");
        other.input_rows = 4;
        let driver = |ops: Vec<OperatorStats>| DriverStats {
            driver_id: 0,
            pipeline_id: 0,
            state: DriverState::Finished,
            elapsed_wall_nanos: 0,
            processed_wall_nanos: 0,
            blocked_wall_nanos: 0,
            operators: ops,
        };
        let a = driver(vec![sample(), other.clone()]);
        let b = driver(vec![other]);
        let summary = summarize_operators([&a, &b]);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].operator_id, 2);
        assert_eq!(summary[0].input_rows, 8);
        assert_eq!(summary[1].operator_id, 41);
    }
}
