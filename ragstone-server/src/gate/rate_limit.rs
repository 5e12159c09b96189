// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tiered rate limiter: a fixed-window counter per identity plus a
//! minimum inter-arrival interval.
//!
//! The bucket table is a bounded moka cache so unique identities cannot
//! grow memory without bound; entries idle for ten windows are evicted,
//! and past `max_identities` the least-recently-touched bucket goes first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use parking_lot::Mutex;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy)]
pub enum GateDecision {
    /// Ticket consumed; `remaining` is what is left of the window quota.
    Allowed { remaining: u32 },
    /// Window quota exhausted.
    RateLimited { retry_after: Duration },
    /// Request arrived before the per-user minimum interval elapsed.
    IntervalLimited { retry_after: Duration },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Seconds to advertise in `Retry-After`, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::Allowed { .. } => 0,
            Self::RateLimited { retry_after } | Self::IntervalLimited { retry_after } => {
                retry_after.as_secs_f64().ceil() as u64
            }
        }
    }
}

#[derive(Debug)]
struct BucketState {
    window_start: Instant,
    count: u32,
    last_accepted: Option<Instant>,
}

/// Per-identity admission state behind a bounded cache.
pub struct TieredRateLimiter {
    window: Duration,
    min_interval: Duration,
    buckets: Cache<String, Arc<Mutex<BucketState>>>,
}

impl TieredRateLimiter {
    pub fn new(window: Duration, min_interval: Duration, max_identities: u64) -> Self {
        let buckets = Cache::builder()
            .max_capacity(max_identities)
            .time_to_idle(window * 10)
            .build();
        Self {
            window,
            min_interval,
            buckets,
        }
    }

    /// Check and consume one ticket for `identity` under `limit` requests
    /// per window. Both the window quota and the minimum interval must
    /// hold for the request to be admitted.
    pub fn check(&self, identity: &str, limit: u32) -> GateDecision {
        let bucket = self.buckets.get_with(identity.to_string(), || {
            Arc::new(Mutex::new(BucketState {
                window_start: Instant::now(),
                count: 0,
                last_accepted: None,
            }))
        });

        let now = Instant::now();
        let mut state = bucket.lock();

        // Roll the window forward when it has elapsed.
        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count >= limit {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(state.window_start));
            return GateDecision::RateLimited { retry_after };
        }

        if !self.min_interval.is_zero() {
            if let Some(last) = state.last_accepted {
                let since = now.duration_since(last);
                if since < self.min_interval {
                    return GateDecision::IntervalLimited {
                        retry_after: self.min_interval - since,
                    };
                }
            }
        }

        state.count += 1;
        state.last_accepted = Some(now);
        GateDecision::Allowed {
            remaining: limit - state.count,
        }
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> u64 {
        self.buckets.run_pending_tasks();
        self.buckets.entry_count()
    }
}
