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
//! Integration tests for the worker pool and task completion.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use novaexec::common::status::ExecError;
use novaexec::exec::operators::{CollectSinkFactory, ResultCollector, ValuesSourceFactory};
use novaexec::exec::pipeline::blocked::BlockedHandle;
use novaexec::exec::pipeline::global_driver_executor::DriverExecutor;
use novaexec::exec::pipeline::operator_factory::OperatorFactory;
use novaexec::exec::pipeline::pipeline::Pipeline;
use novaexec::exec::pipeline::task_execution::TaskExecution;
use novaexec::runtime::memory_pool::{MemoryPool, MemoryPoolId};
use novaexec::runtime::query_context::QueryMemoryLimits;
use novaexec::runtime::task_context::TaskState;

use crate::common::{
    GatedSourceFactory, int_chunks, new_query, no_limits, query_on_pool, unique_query_id,
    wait_for,
};

mod common;

const POOL_BYTES: i64 = 10 << 20;
const WAIT: Duration = Duration::from_secs(10);

fn executor() -> DriverExecutor {
    DriverExecutor::new(2, Duration::from_millis(20))
}

fn values_to_sink(chunks: usize, rows: usize, collector: &Arc<ResultCollector>) -> Pipeline {
    let factories: Vec<Arc<dyn OperatorFactory>> = vec![
        Arc::new(ValuesSourceFactory::new(1, int_chunks(chunks, rows))),
        Arc::new(CollectSinkFactory::new(2, Arc::clone(collector))),
    ];
    Pipeline::new(0, factories, 1).expect("build pipeline")
}

fn gated_pipeline(gate: BlockedHandle) -> Pipeline {
    let factories: Vec<Arc<dyn OperatorFactory>> = vec![
        Arc::new(GatedSourceFactory::new(1, gate)),
        Arc::new(CollectSinkFactory::new(2, ResultCollector::new())),
    ];
    Pipeline::new(1, factories, 1).expect("build pipeline")
}

#[test]
fn test_pipeline_waits_for_pool_and_completes_after_free() {
    let pool = Arc::new(MemoryPool::new(MemoryPoolId::new("full_pool"), POOL_BYTES));
    let hog = unique_query_id("pool_hog");
    assert!(pool.try_reserve(hog, POOL_BYTES).expect("fill pool"));

    let query = query_on_pool("waits_for_pool", &pool, no_limits());
    let task = query.add_task_context(0);
    let collector = ResultCollector::new();
    let executor = executor();
    let execution = TaskExecution::start(
        &executor,
        Arc::clone(&task),
        &[values_to_sink(3, 64, &collector)],
    )
    .expect("start task");

    assert!(wait_for(|| task.stats().blocked_drivers == 1, WAIT));
    assert!(execution.wait_timeout(Duration::from_millis(100)).is_none());
    assert_eq!(collector.num_chunks(), 1);
    assert_eq!(task.state(), TaskState::Running);

    pool.free(hog, POOL_BYTES).expect("free pool");
    let result = execution.wait_timeout(WAIT).expect("task completes");
    assert!(result.is_ok(), "got {result:?}");
    assert_eq!(task.state(), TaskState::Finished);
    assert_eq!(collector.num_chunks(), 3);
    assert_eq!(collector.num_rows(), 192);
    assert_eq!(pool.reserved_bytes(), 0);
    assert!(query.close().is_ok());
}

#[test]
fn test_cancel_wakes_blocked_task() {
    let pool = Arc::new(MemoryPool::new(MemoryPoolId::new("cancel_pool"), POOL_BYTES));
    let hog = unique_query_id("cancel_hog");
    assert!(pool.try_reserve(hog, POOL_BYTES).expect("fill pool"));

    let query = query_on_pool("cancel_blocked_task", &pool, no_limits());
    let task = query.add_task_context(0);
    let collector = ResultCollector::new();
    let executor = executor();
    let execution = TaskExecution::start(
        &executor,
        Arc::clone(&task),
        &[values_to_sink(3, 64, &collector)],
    )
    .expect("start task");
    assert!(wait_for(|| task.stats().blocked_drivers == 1, WAIT));

    execution.cancel();
    let result = execution.wait_timeout(WAIT).expect("cancel completes the task");
    assert!(matches!(result, Err(ExecError::Cancelled(_))), "got {result:?}");
    assert_eq!(task.state(), TaskState::Canceled);
    // Only the hog still holds memory; the cancelled driver returned its chunk reservation.
    assert_eq!(pool.query_reservation(query.query_id()), 0);
    assert_eq!(pool.reserved_bytes(), POOL_BYTES);
    pool.free(hog, POOL_BYTES).expect("free pool");
}

#[test]
fn test_memory_limit_fails_every_task_of_the_query() {
    let limits = QueryMemoryLimits {
        max_memory_bytes: Some(1024),
        max_total_memory_bytes: None,
    };
    let (query, pool) = new_query("memory_limit", POOL_BYTES, limits);
    let executor = executor();

    let (gate, _gate_resolver) = BlockedHandle::pending("never-opens");
    let waiting_task = query.add_task_context(0);
    let waiting = TaskExecution::start(&executor, Arc::clone(&waiting_task), &[gated_pipeline(gate)])
        .expect("start waiting task");
    assert!(wait_for(|| waiting_task.stats().blocked_drivers == 1, WAIT));

    let greedy_task = query.add_task_context(1);
    let collector = ResultCollector::new();
    let greedy = TaskExecution::start(
        &executor,
        Arc::clone(&greedy_task),
        &[values_to_sink(1, 4096, &collector)],
    )
    .expect("start greedy task");

    let greedy_result = greedy.wait_timeout(WAIT).expect("greedy task completes");
    assert!(
        matches!(greedy_result, Err(ExecError::ExceededMemoryLimit { .. })),
        "got {greedy_result:?}"
    );
    let waiting_result = waiting.wait_timeout(WAIT).expect("waiting task is woken");
    assert!(
        matches!(waiting_result, Err(ExecError::ExceededMemoryLimit { .. })),
        "got {waiting_result:?}"
    );
    assert_eq!(greedy_task.state(), TaskState::Failed);
    assert_eq!(waiting_task.state(), TaskState::Failed);
    assert!(query.is_cancelled());
    assert_eq!(collector.num_chunks(), 0);
    assert_eq!(query.reserved_bytes(), 0);
    assert_eq!(pool.reserved_bytes(), 0);
}

#[test]
fn test_parallel_drivers_share_one_collector() {
    let (query, pool) = new_query("parallel_drivers", POOL_BYTES, no_limits());
    let task = query.add_task_context(0);
    let collector = ResultCollector::new();
    let factories: Vec<Arc<dyn OperatorFactory>> = vec![
        Arc::new(ValuesSourceFactory::new(1, int_chunks(12, 16)).with_parallelism(4)),
        Arc::new(CollectSinkFactory::new(2, Arc::clone(&collector))),
    ];
    let pipeline = Pipeline::new(0, factories, 4).expect("build pipeline");
    let executor = executor();

    let execution =
        TaskExecution::start(&executor, Arc::clone(&task), &[pipeline]).expect("start task");
    let result = execution.wait_timeout(WAIT).expect("task completes");
    assert!(result.is_ok(), "got {result:?}");
    assert_eq!(collector.num_chunks(), 12);
    assert_eq!(collector.num_rows(), 192);
    assert_eq!(collector.finished_sinks(), 4);

    let stats = task.stats();
    assert_eq!(stats.total_drivers, 4);
    assert_eq!(stats.completed_drivers, 4);
    assert_eq!(stats.state, TaskState::Finished);
    assert_eq!(pool.reserved_bytes(), 0);
}

#[test]
fn test_driver_is_submitted_once() {
    let (query, _pool) = new_query("submit_once", POOL_BYTES, no_limits());
    let task = query.add_task_context(0);
    let collector = ResultCollector::new();
    let drivers = values_to_sink(2, 8, &collector)
        .instantiate_drivers(&task)
        .expect("instantiate drivers");
    let driver = Arc::clone(&drivers[0]);
    let executor = executor();

    let execution =
        TaskExecution::start_drivers(&executor, Arc::clone(&task), drivers).expect("start task");
    let err = executor
        .submit(driver, Arc::clone(&execution))
        .expect_err("second submission rejected");
    assert!(matches!(err, ExecError::InvalidArgument(_)));

    let result = execution.wait_timeout(WAIT).expect("task completes");
    assert!(result.is_ok(), "got {result:?}");
    assert_eq!(collector.num_chunks(), 2);
}

#[test]
fn test_shutdown_executor_cancels_new_drivers() {
    let (query, pool) = new_query("shutdown_executor", POOL_BYTES, no_limits());
    let task = query.add_task_context(0);
    let collector = ResultCollector::new();
    let executor = executor();
    executor.shutdown();

    let execution = TaskExecution::start(
        &executor,
        Arc::clone(&task),
        &[values_to_sink(2, 8, &collector)],
    )
    .expect("start task");
    assert!(execution.is_done());
    let result = execution.wait();
    assert!(matches!(result, Err(ExecError::Cancelled(_))), "got {result:?}");
    assert_eq!(collector.num_chunks(), 0);
    assert_eq!(pool.reserved_bytes(), 0);
}

#[test]
fn test_cancel_after_shutdown_tears_down_parked_drivers() {
    let chunk_bytes = int_chunks(1, 64)[0].estimated_bytes() as i64;
    let (query, pool) = new_query("cancel_after_shutdown", 5 * chunk_bytes, no_limits());
    let task = query.add_task_context(0);
    let collector = ResultCollector::new();
    let factories: Vec<Arc<dyn OperatorFactory>> = vec![
        Arc::new(ValuesSourceFactory::new(1, int_chunks(16, 64)).with_parallelism(2)),
        Arc::new(CollectSinkFactory::new(2, Arc::clone(&collector))),
    ];
    let pipeline = Pipeline::new(0, factories, 2).expect("build pipeline");
    let executor = executor();
    let execution =
        TaskExecution::start(&executor, Arc::clone(&task), &[pipeline]).expect("start task");
    assert!(wait_for(|| task.stats().blocked_drivers == 2, WAIT));
    assert!(pool.reserved_bytes() >= pool.max_bytes());

    executor.shutdown();
    let (tx, rx) = mpsc::channel();
    let cancelling = Arc::clone(&task);
    thread::spawn(move || {
        cancelling.cancel();
        let _ = tx.send(());
    });
    rx.recv_timeout(WAIT).expect("task cancel returns after executor shutdown");

    let result = execution.wait_timeout(WAIT).expect("parked drivers are torn down");
    assert!(matches!(result, Err(ExecError::Cancelled(_))), "got {result:?}");
    assert_eq!(task.state(), TaskState::Canceled);
    assert_eq!(task.reserved_bytes(), 0);
    assert_eq!(pool.reserved_bytes(), 0);
    assert!(query.close().is_ok());
}
