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

//! Per-request telemetry: counters, a fixed-bucket latency histogram and
//! per-route aggregates, plus the cached reachability probe the health
//! endpoint uses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::llm::EmbeddingProvider;

/// Upper bounds (milliseconds) of the latency histogram buckets; the last
/// bucket is open-ended.
const LATENCY_BUCKETS_MS: [u64; 12] = [
    5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 60_000,
];

#[derive(Default)]
struct RouteCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    total_ms: AtomicU64,
}

pub struct MetricsRegistry {
    started: Instant,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    latency_sum_ms: AtomicU64,
    per_route: DashMap<String, RouteCounters>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    pub route: String,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub requests_total: u64,
    pub errors_total: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub routes: Vec<RouteSnapshot>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency_buckets: Default::default(),
            latency_sum_ms: AtomicU64::new(0),
            per_route: DashMap::new(),
        }
    }

    pub fn record(
        &self,
        method: &str,
        route: &str,
        status: u16,
        latency: Duration,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        let latency_ms = latency.as_millis() as u64;
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| latency_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        let key = format!("{method} {route}");
        let counters = self.per_route.entry(key).or_default();
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        counters.total_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    fn percentile(&self, counts: &[u64], total: u64, quantile: f64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let target = (total as f64 * quantile).ceil() as u64;
        let mut seen = 0u64;
        for (i, &count) in counts.iter().enumerate() {
            seen += count;
            if seen >= target {
                return if i < LATENCY_BUCKETS_MS.len() {
                    LATENCY_BUCKETS_MS[i] as f64
                } else {
                    // Open-ended bucket reports its lower bound.
                    *LATENCY_BUCKETS_MS.last().unwrap() as f64
                };
            }
        }
        0.0
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counts: Vec<u64> = self
            .latency_buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let total = self.requests_total.load(Ordering::Relaxed);

        let mut routes: Vec<RouteSnapshot> = self
            .per_route
            .iter()
            .map(|entry| {
                let requests = entry.requests.load(Ordering::Relaxed);
                RouteSnapshot {
                    route: entry.key().clone(),
                    requests,
                    errors: entry.errors.load(Ordering::Relaxed),
                    avg_latency_ms: if requests > 0 {
                        entry.total_ms.load(Ordering::Relaxed) as f64 / requests as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect();
        routes.sort_by(|a, b| b.requests.cmp(&a.requests));

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            requests_total: total,
            errors_total: self.errors_total.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            avg_latency_ms: if total > 0 {
                self.latency_sum_ms.load(Ordering::Relaxed) as f64 / total as f64
            } else {
                0.0
            },
            latency_p50_ms: self.percentile(&counts, total, 0.50),
            latency_p95_ms: self.percentile(&counts, total, 0.95),
            latency_p99_ms: self.percentile(&counts, total, 0.99),
            routes,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reachability probe with a short-lived cached verdict, so the health
/// endpoint stays inside its 3-second budget even when hammered.
pub struct HealthProbe {
    ttl: Duration,
    last: Mutex<Option<(Instant, Result<(), String>)>>,
}

impl HealthProbe {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last: Mutex::new(None),
        }
    }

    pub async fn embedding_reachable(&self, embedder: &dyn EmbeddingProvider) -> Result<(), String> {
        if let Some((at, verdict)) = self.last.lock().clone() {
            if at.elapsed() < self.ttl {
                return verdict;
            }
        }

        let verdict = match tokio::time::timeout(Duration::from_secs(3), embedder.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("embedding probe timed out".to_string()),
        };
        *self.last.lock() = Some((Instant::now(), verdict.clone()));
        verdict
    }
}
