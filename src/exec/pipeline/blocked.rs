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
//! Suspension handles for cooperative scheduling.
//!
//! Responsibilities:
//! - Represents "not yet, but eventually" readiness without parking a thread.
//! - Splits the consumer side (`BlockedHandle`) from the resolver side (`BlockedResolver`),
//!   so only the owner of a blocking condition (memory pool, task cancellation, an operator's
//!   external dependency) can complete it.
//!
//! Key exported interfaces:
//! - Types: `BlockedOutcome`, `BlockedHandle`, `BlockedResolver`.
//!
//! A handle resolves exactly once. Continuations run on the resolving thread after every
//! internal lock is released, or immediately on the registering thread when the handle has
//! already resolved.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::exec::pipeline::schedule::observer::Observable;

static NEXT_HANDLE_ID: AtomicUsize = AtomicUsize::new(1);
static NOT_BLOCKED: OnceLock<BlockedHandle> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How a blocking condition cleared.
pub enum BlockedOutcome {
    /// The condition cleared; the waiter should re-check and retry.
    Ready,
    /// The owning task was cancelled; the waiter should tear down.
    Cancelled,
}

struct BlockedInner {
    id: usize,
    name: String,
    observable: Observable,
}

#[derive(Clone)]
/// Consumer side of a suspension: poll it or attach continuations.
pub struct BlockedHandle {
    inner: Arc<BlockedInner>,
}

#[derive(Clone)]
/// Resolver side of a suspension.
pub struct BlockedResolver {
    inner: Arc<BlockedInner>,
}

impl fmt::Debug for BlockedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockedHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl fmt::Debug for BlockedResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockedResolver")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl PartialEq for BlockedHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for BlockedHandle {}

impl BlockedHandle {
    /// Shared, already-resolved handle.
    pub fn not_blocked() -> Self {
        NOT_BLOCKED
            .get_or_init(|| {
                let (handle, resolver) = Self::pending("not_blocked");
                resolver.resolve();
                handle
            })
            .clone()
    }

    pub fn pending(name: impl Into<String>) -> (BlockedHandle, BlockedResolver) {
        let inner = Arc::new(BlockedInner {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            observable: Observable::new(),
        });
        (
            BlockedHandle {
                inner: Arc::clone(&inner),
            },
            BlockedResolver { inner },
        )
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn outcome(&self) -> Option<BlockedOutcome> {
        self.inner.observable.fired()
    }

    pub fn add_continuation<F>(&self, f: F)
    where
        F: FnOnce(BlockedOutcome) + Send + 'static,
    {
        if let Some((observer, outcome)) = self.inner.observable.add_observer(Box::new(f)) {
            observer(outcome);
        }
    }

    /// Handle that resolves with the outcome of whichever input resolves first.
    pub fn any(name: impl Into<String>, handles: &[BlockedHandle]) -> BlockedHandle {
        if let Some(done) = handles.iter().find(|h| h.is_resolved()) {
            return done.clone();
        }
        if handles.len() == 1 {
            return handles[0].clone();
        }
        let (combined, resolver) = Self::pending(name);
        for handle in handles {
            let resolver = resolver.clone();
            handle.add_continuation(move |outcome| {
                resolver.complete(outcome);
            });
        }
        combined
    }

    /// Wait for resolution from outside the worker pool. Test and debugging paths only.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BlockedOutcome> {
        if let Some(outcome) = self.outcome() {
            return Some(outcome);
        }
        let (tx, rx) = mpsc::channel();
        self.add_continuation(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.recv_timeout(timeout).ok()
    }
}

impl BlockedResolver {
    pub fn handle(&self) -> BlockedHandle {
        BlockedHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.observable.fired().is_some()
    }

    /// Resolve as ready. Returns false if the handle had already resolved.
    pub fn resolve(&self) -> bool {
        self.complete(BlockedOutcome::Ready)
    }

    /// Resolve as cancelled. Returns false if the handle had already resolved.
    pub fn cancel(&self) -> bool {
        self.complete(BlockedOutcome::Cancelled)
    }

    fn complete(&self, outcome: BlockedOutcome) -> bool {
        match self.inner.observable.fire(outcome) {
            Some(notify) => {
                drop(notify);
                true
            }
            None => false,
        }
    }
}
