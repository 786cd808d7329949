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
//! One-shot observer registry.
//!
//! Responsibilities:
//! - Stores continuations registered against a not-yet-fired event.
//! - Fires every registered continuation exactly once, outside of the registry lock.
//!
//! Key exported interfaces:
//! - Types: `Observer`, `Observable`, `DeferNotify`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::exec::pipeline::blocked::BlockedOutcome;
use crate::novaexec_logging::debug;

static NOTIFY_COUNT: AtomicU64 = AtomicU64::new(0);

const OBSERVER_LOG_EVERY: u64 = 1024;

/// Callback invoked once with the outcome of the observed event.
pub type Observer = Box<dyn FnOnce(BlockedOutcome) + Send + 'static>;

struct ObservableState {
    fired: Option<BlockedOutcome>,
    observers: Vec<Observer>,
}

/// Registry of observers waiting for a single event.
pub struct Observable {
    state: Mutex<ObservableState>,
}

impl Observable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ObservableState {
                fired: None,
                observers: Vec::new(),
            }),
        }
    }

    pub fn fired(&self) -> Option<BlockedOutcome> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).fired
    }

    /// Register `observer`. If the event already fired the observer is handed back
    /// together with the outcome so the caller can run it without holding the lock.
    pub fn add_observer(&self, observer: Observer) -> Option<(Observer, BlockedOutcome)> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(outcome) = guard.fired {
            return Some((observer, outcome));
        }
        guard.observers.push(observer);
        None
    }

    /// Mark the event fired. Returns `None` when it had already fired.
    /// The returned notifier runs the drained observers on drop.
    pub fn fire(&self, outcome: BlockedOutcome) -> Option<DeferNotify> {
        let observers = {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if guard.fired.is_some() {
                return None;
            }
            guard.fired = Some(outcome);
            std::mem::take(&mut guard.observers)
        };
        Some(DeferNotify {
            observers,
            outcome,
        })
    }

    pub fn num_observers(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observers
            .len()
    }
}

impl Default for Observable {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs drained observers when dropped, after every registry lock has been released.
#[must_use]
pub struct DeferNotify {
    observers: Vec<Observer>,
    outcome: BlockedOutcome,
}

impl Drop for DeferNotify {
    fn drop(&mut self) {
        let observers = std::mem::take(&mut self.observers);
        let notify_count = NOTIFY_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        if notify_count % OBSERVER_LOG_EVERY == 0 {
            debug!(
                "Observable notify: count={} observers={} outcome={:?}",
                notify_count,
                observers.len(),
                self.outcome
            );
        }
        for observer in observers {
            observer(self.outcome);
        }
    }
}
