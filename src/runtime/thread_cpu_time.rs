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
//! Per-thread CPU clock used for operator call counters.
//!
//! Key exported interfaces:
//! - Functions: `current_thread_cpu_time_ns`.
//! - Types: `CallTimer`.

use std::time::{Duration, Instant};

/// CPU time consumed by the calling thread, or `None` where the platform has no such clock.
pub fn current_thread_cpu_time_ns() -> Option<u128> {
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
        if rc != 0 || ts.tv_sec < 0 || ts.tv_nsec < 0 {
            return None;
        }
        Some((ts.tv_sec as u128).saturating_mul(1_000_000_000) + ts.tv_nsec as u128)
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    {
        None
    }
}

/// Measures wall and thread CPU time of one operator call.
pub(crate) struct CallTimer {
    wall_start: Instant,
    cpu_start_ns: Option<u128>,
}

impl CallTimer {
    pub(crate) fn start() -> Self {
        Self {
            wall_start: Instant::now(),
            cpu_start_ns: current_thread_cpu_time_ns(),
        }
    }

    /// Returns `(wall, cpu)`. CPU is zero when the clock is unavailable.
    pub(crate) fn stop(self) -> (Duration, Duration) {
        let wall = self.wall_start.elapsed();
        let cpu = match (self.cpu_start_ns, current_thread_cpu_time_ns()) {
            (Some(start), Some(end)) if end >= start => {
                Duration::from_nanos(u64::try_from(end - start).unwrap_or(u64::MAX))
            }
            _ => Duration::ZERO,
        };
        (wall, cpu)
    }
}
