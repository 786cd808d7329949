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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Array, ArrayRef, BooleanArray, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tempfile::TempDir;

use novaexec::common::status::{ExecError, ExecResult};
use novaexec::common::types::{QueryId, UniqueId};
use novaexec::exec::chunk::Chunk;
use novaexec::exec::pipeline::blocked::BlockedHandle;
use novaexec::exec::pipeline::operator::Operator;
use novaexec::exec::pipeline::operator_context::OperatorContext;
use novaexec::exec::pipeline::operator_factory::OperatorFactory;
use novaexec::novaexec_config;
use novaexec::novaexec_logging;
use novaexec::runtime::memory_pool::{MemoryPool, MemoryPoolId};
use novaexec::runtime::query_context::{QueryContext, QueryMemoryLimits};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_content(
            r#"
log_level = "debug"

[pool]
capacity_bytes = 10485760
system_capacity_bytes = 1048576

[query]
max_memory_bytes = 8388608

[runtime]
pipeline_exec_thread_pool_thread_num = 2
driver_time_slice_ms = 50
"#,
        )
    }

    /// Create a test configuration from a raw TOML document.
    pub fn with_content(content: &str) -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novaexec.toml");
        std::fs::write(&config_path, content)?;
        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novaexec_logging::init_with_level("debug");
    }

    /// Parse the test configuration without installing it globally.
    pub fn load(&self) -> anyhow::Result<novaexec_config::NovaExecConfig> {
        novaexec_config::NovaExecConfig::load_from_file(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Generate a unique query ID based on test name.
pub fn unique_query_id(test_name: &str) -> QueryId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    UniqueId {
        hi: hash as i64,
        lo: (hash >> 32) as i64,
    }
}

/// Query context on dedicated pools, so tests never share a ledger by accident.
pub fn new_query(
    test_name: &str,
    capacity_bytes: i64,
    limits: QueryMemoryLimits,
) -> (Arc<QueryContext>, Arc<MemoryPool>) {
    let pool = Arc::new(MemoryPool::new(
        MemoryPoolId::new(format!("{test_name}-general")),
        capacity_bytes,
    ));
    let system_pool = Arc::new(MemoryPool::new(
        MemoryPoolId::new(format!("{test_name}-system")),
        capacity_bytes,
    ));
    let query = QueryContext::new(
        unique_query_id(test_name),
        limits,
        Arc::clone(&pool),
        system_pool,
    );
    (query, pool)
}

/// Query context reserving from an existing pool.
pub fn query_on_pool(test_name: &str, pool: &Arc<MemoryPool>, limits: QueryMemoryLimits) -> Arc<QueryContext> {
    let system_pool = Arc::new(MemoryPool::new(
        MemoryPoolId::new(format!("{test_name}-system")),
        pool.max_bytes(),
    ));
    QueryContext::new(
        unique_query_id(test_name),
        limits,
        Arc::clone(pool),
        system_pool,
    )
}

pub fn no_limits() -> QueryMemoryLimits {
    QueryMemoryLimits::default()
}

/// Single-column `v: Int64` chunk.
pub fn int_chunk(values: &[i64]) -> Chunk {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
    let column: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
    Chunk::new(RecordBatch::try_new(schema, vec![column]).expect("build int chunk"))
}

/// `count` chunks of `rows` rows each, numbered consecutively from zero.
pub fn int_chunks(count: usize, rows: usize) -> Vec<Chunk> {
    (0..count)
        .map(|c| {
            let start = (c * rows) as i64;
            let values: Vec<i64> = (start..start + rows as i64).collect();
            int_chunk(&values)
        })
        .collect()
}

/// Filter predicate `v >= min` over the first column.
pub fn at_least(min: i64) -> impl Fn(&Chunk) -> ExecResult<BooleanArray> + Send + Sync + 'static {
    move |chunk: &Chunk| {
        let column = chunk
            .columns()
            .first()
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .ok_or_else(|| ExecError::Internal("expected an Int64 column".to_string()))?;
        Ok(column.iter().map(|v| v.map(|v| v >= min)).collect())
    }
}

/// Per-method call counters shared between a counting operator and the test.
#[derive(Default)]
pub struct CallLog {
    pub is_blocked: AtomicUsize,
    pub needs_input: AtomicUsize,
    pub add_input: AtomicUsize,
    pub get_output: AtomicUsize,
    pub finish: AtomicUsize,
    pub is_finished: AtomicUsize,
    pub close: AtomicUsize,
    /// Calls other than `close` made after `is_finished` returned true.
    pub after_finished: AtomicUsize,
}

impl CallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn total(&self) -> usize {
        [
            &self.is_blocked,
            &self.needs_input,
            &self.add_input,
            &self.get_output,
            &self.finish,
            &self.is_finished,
            &self.close,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Wraps another factory and counts every call the driver makes on its operators.
pub struct CountingFactory {
    inner: Arc<dyn OperatorFactory>,
    log: Arc<CallLog>,
}

impl CountingFactory {
    pub fn new(inner: Arc<dyn OperatorFactory>, log: Arc<CallLog>) -> Self {
        Self { inner, log }
    }
}

impl OperatorFactory for CountingFactory {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn operator_id(&self) -> i32 {
        self.inner.operator_id()
    }

    fn create(&self, ctx: Arc<OperatorContext>) -> ExecResult<Box<dyn Operator>> {
        Ok(Box::new(CountingOperator {
            inner: self.inner.create(ctx)?,
            log: Arc::clone(&self.log),
            reported_finished: AtomicBool::new(false),
        }))
    }
}

struct CountingOperator {
    inner: Box<dyn Operator>,
    log: Arc<CallLog>,
    reported_finished: AtomicBool,
}

impl CountingOperator {
    fn called(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.reported_finished.load(Ordering::SeqCst) {
            self.log.after_finished.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Operator for CountingOperator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_blocked(&self) -> BlockedHandle {
        self.called(&self.log.is_blocked);
        self.inner.is_blocked()
    }

    fn needs_input(&self) -> bool {
        self.called(&self.log.needs_input);
        self.inner.needs_input()
    }

    fn add_input(&mut self, chunk: Chunk) -> ExecResult<()> {
        self.called(&self.log.add_input);
        self.inner.add_input(chunk)
    }

    fn get_output(&mut self) -> ExecResult<Option<Chunk>> {
        self.called(&self.log.get_output);
        self.inner.get_output()
    }

    fn finish(&mut self) -> ExecResult<()> {
        self.called(&self.log.finish);
        self.inner.finish()
    }

    fn is_finished(&self) -> bool {
        self.called(&self.log.is_finished);
        let finished = self.inner.is_finished();
        if finished {
            self.reported_finished.store(true, Ordering::SeqCst);
        }
        finished
    }

    fn close(&mut self) -> ExecResult<()> {
        self.log.close.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

/// Source that reserves `bytes_per_chunk` on every `get_output` and fails on call
/// number `fail_on_call` (1-based). Reservations are only returned by driver teardown.
pub struct FailingSourceFactory {
    operator_id: i32,
    bytes_per_chunk: i64,
    fail_on_call: usize,
}

impl FailingSourceFactory {
    pub fn new(operator_id: i32, bytes_per_chunk: i64, fail_on_call: usize) -> Self {
        Self {
            operator_id,
            bytes_per_chunk,
            fail_on_call,
        }
    }
}

impl OperatorFactory for FailingSourceFactory {
    fn name(&self) -> &str {
        "FailingSource"
    }

    fn operator_id(&self) -> i32 {
        self.operator_id
    }

    fn create(&self, ctx: Arc<OperatorContext>) -> ExecResult<Box<dyn Operator>> {
        Ok(Box::new(FailingSourceOperator {
            ctx,
            bytes_per_chunk: self.bytes_per_chunk,
            fail_on_call: self.fail_on_call,
            calls: 0,
        }))
    }
}

struct FailingSourceOperator {
    ctx: Arc<OperatorContext>,
    bytes_per_chunk: i64,
    fail_on_call: usize,
    calls: usize,
}

impl Operator for FailingSourceOperator {
    fn name(&self) -> &str {
        "FailingSource"
    }

    fn needs_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, _chunk: Chunk) -> ExecResult<()> {
        Err(ExecError::operator("FailingSource", "source does not accept input"))
    }

    fn get_output(&mut self) -> ExecResult<Option<Chunk>> {
        self.calls += 1;
        if self.calls == self.fail_on_call {
            return Err(ExecError::operator("FailingSource", "injected failure"));
        }
        self.ctx.reserve(self.bytes_per_chunk)?;
        Ok(Some(int_chunk(&[self.calls as i64])))
    }

    fn finish(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn is_finished(&self) -> bool {
        false
    }
}

/// Source that stays blocked on an externally controlled handle and never produces data.
pub struct GatedSourceFactory {
    operator_id: i32,
    gate: BlockedHandle,
}

impl GatedSourceFactory {
    pub fn new(operator_id: i32, gate: BlockedHandle) -> Self {
        Self { operator_id, gate }
    }
}

impl OperatorFactory for GatedSourceFactory {
    fn name(&self) -> &str {
        "GatedSource"
    }

    fn operator_id(&self) -> i32 {
        self.operator_id
    }

    fn create(&self, _ctx: Arc<OperatorContext>) -> ExecResult<Box<dyn Operator>> {
        Ok(Box::new(GatedSourceOperator {
            gate: self.gate.clone(),
        }))
    }
}

struct GatedSourceOperator {
    gate: BlockedHandle,
}

impl Operator for GatedSourceOperator {
    fn name(&self) -> &str {
        "GatedSource"
    }

    fn is_blocked(&self) -> BlockedHandle {
        self.gate.clone()
    }

    fn needs_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, _chunk: Chunk) -> ExecResult<()> {
        Err(ExecError::operator("GatedSource", "source does not accept input"))
    }

    fn get_output(&mut self) -> ExecResult<Option<Chunk>> {
        Ok(None)
    }

    fn finish(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.gate.is_resolved()
    }
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
}
