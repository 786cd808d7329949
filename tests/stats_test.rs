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
//! Tests for operator, driver and task statistics.

use std::sync::Arc;

use novaexec::exec::operators::{ChunkTransformFactory, CollectSinkFactory, ResultCollector, ValuesSourceFactory};
use novaexec::exec::pipeline::driver::DriverStep;
use novaexec::exec::pipeline::operator_factory::OperatorFactory;
use novaexec::exec::pipeline::pipeline::Pipeline;
use novaexec::runtime::stats::{OperatorStats, TaskStats};
use novaexec::runtime::task_context::TaskState;

use crate::common::{at_least, int_chunks, new_query, no_limits};

mod common;

#[test]
fn test_task_stats_after_filter_pipeline() {
    let (query, _pool) = new_query("stats_filter_pipeline", 64 << 20, no_limits());
    let task = query.add_task_context(0);
    let collector = ResultCollector::new();
    let factories: Vec<Arc<dyn OperatorFactory>> = vec![
        Arc::new(ValuesSourceFactory::new(1, int_chunks(4, 8))),
        Arc::new(ChunkTransformFactory::filter(2, at_least(10))),
        Arc::new(CollectSinkFactory::new(3, Arc::clone(&collector))),
    ];
    let pipeline = Pipeline::new(0, factories, 1).expect("build pipeline");
    let driver = pipeline
        .instantiate_drivers(&task)
        .expect("instantiate drivers")
        .remove(0);

    let mut finished = false;
    for _ in 0..100 {
        match driver.process() {
            DriverStep::Ready => continue,
            DriverStep::Finished => {
                finished = true;
                break;
            }
            other => panic!("unexpected step {other:?}"),
        }
    }
    assert!(finished);
    assert_eq!(collector.num_rows(), 22);

    let stats = task.stats();
    assert_eq!(stats.state, TaskState::Running);
    assert_eq!(stats.total_drivers, 1);
    assert_eq!(stats.completed_drivers, 1);
    assert_eq!(stats.blocked_drivers, 0);
    assert_eq!(stats.memory_reservation_bytes, 0);

    let ops = &stats.operator_summaries;
    assert_eq!(ops.len(), 3);
    assert_eq!(ops[0].operator_id, 1);
    assert_eq!(ops[0].output_rows, 32);
    assert_eq!(ops[1].input_rows, 32);
    assert_eq!(ops[1].output_rows, 22);
    assert_eq!(ops[1].finish_calls, 1);
    assert_eq!(ops[2].input_rows, 22);
    assert_eq!(ops[2].add_input_calls, 3);
    assert_eq!(ops[2].finish_calls, 1);
    assert_eq!(ops[2].memory_reservation_bytes, 0);
    assert!(ops[2].peak_memory_reservation_bytes > 0);

    let json = serde_json::to_string(&stats).expect("serialize task stats");
    let decoded: TaskStats = serde_json::from_str(&json).expect("deserialize task stats");
    assert_eq!(decoded, stats);
}

#[test]
fn test_operator_stats_merge_across_drivers() {
    let mut a = OperatorStats::new(7, "FILTER");
    a.input_rows = 10;
    a.output_rows = 4;
    a.peak_memory_reservation_bytes = 100;
    let mut b = OperatorStats::new(7, "FILTER");
    b.input_rows = 5;
    b.output_rows = 5;
    b.peak_memory_reservation_bytes = 300;
    b.blocked = true;

    let merged = a.add(&[b]);
    assert_eq!(merged.operator_id, 7);
    assert_eq!(merged.operator_type, "FILTER");
    assert_eq!(merged.input_rows, 15);
    assert_eq!(merged.output_rows, 9);
    assert_eq!(merged.peak_memory_reservation_bytes, 300);
    assert!(merged.blocked);
}
