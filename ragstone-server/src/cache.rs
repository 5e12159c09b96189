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

//! Multi-tier cache coordinator.
//!
//! Five named caches with uniform get/set/clear/stats semantics:
//! `llm_response`, `vector`, `knowledge_graph`, `documents`, `queries`.
//! Values are opaque blobs keyed by a SHA-256 fingerprint; absence is
//! always a miss, never an error.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;
use serde::Serialize;
use sha2::{Digest, Sha256};

use ragstone_core::ServiceError;

pub const CACHE_NAMES: [&str; 5] = [
    "llm_response",
    "vector",
    "knowledge_graph",
    "documents",
    "queries",
];

/// Order used by `clear_all`: cheapest-to-rebuild first, vectors last.
const CLEAR_ORDER: [&str; 5] = [
    "queries",
    "documents",
    "llm_response",
    "knowledge_graph",
    "vector",
];

const DEFAULT_BUDGET_MB: u64 = 64;

/// One cached blob plus the metadata the coordinator tracks for it.
#[derive(Clone)]
struct CacheEntry {
    data: Arc<Vec<u8>>,
    inserted_at: Instant,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CacheEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// A single named cache region: LRU bounded by bytes, per-entry TTL,
/// sliding hit-rate counters.
pub struct CacheRegion {
    name: &'static str,
    cache: Cache<String, CacheEntry>,
    budget_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheRegion {
    fn new(name: &'static str, budget_mb: u64) -> Self {
        let budget_bytes = budget_mb.max(1) * 1024 * 1024;
        let cache = Cache::builder()
            .max_capacity(budget_bytes)
            .weigher(|key: &String, entry: &CacheEntry| {
                (key.len() + entry.data.len()).min(u32::MAX as usize) as u32
            })
            .expire_after(PerEntryTtl)
            .build();
        Self {
            name,
            cache,
            budget_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Never fails; expired entries count as misses.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        match self.cache.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Best-effort insert. Values larger than an eighth of the region
    /// budget are refused rather than churning the whole region.
    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        if value.len() as u64 > self.budget_bytes / 8 {
            tracing::debug!(
                cache = self.name,
                bytes = value.len(),
                "refusing oversize cache entry"
            );
            return false;
        }
        self.cache.insert(
            key.to_string(),
            CacheEntry {
                data: Arc::new(value),
                inserted_at: Instant::now(),
                ttl,
            },
        );
        true
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Drop everything; returns (entries removed, bytes freed).
    pub fn clear(&self) -> (u64, u64) {
        self.cache.run_pending_tasks();
        let count = self.cache.entry_count();
        let bytes = self.cache.weighted_size();
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        (count, bytes)
    }

    pub fn stats(&self) -> CacheRegionStats {
        self.cache.run_pending_tasks();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheRegionStats {
            name: self.name.to_string(),
            item_count: self.cache.entry_count(),
            size_mb: self.cache.weighted_size() as f64 / (1024.0 * 1024.0),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            hits,
            misses,
        }
    }

    /// Age of an entry, surfaced for debugging endpoints.
    pub fn entry_age(&self, key: &str) -> Option<Duration> {
        self.cache.get(key).map(|e| e.inserted_at.elapsed())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheRegionStats {
    pub name: String,
    pub item_count: u64,
    pub size_mb: f64,
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub caches: Vec<CacheRegionStats>,
    pub total_size_mb: f64,
    pub process_memory_mb: f64,
    pub host_memory_total_mb: f64,
    pub host_memory_available_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub cleared_caches: Vec<String>,
    pub entries_removed: u64,
    pub freed_mb: f64,
}

/// Owner of the five cache regions.
pub struct CacheCoordinator {
    regions: Vec<Arc<CacheRegion>>,
    enabled: bool,
    default_ttl: Duration,
}

impl CacheCoordinator {
    pub fn new(enabled: bool, default_ttl: Duration, budgets_mb: &BTreeMap<String, u64>) -> Self {
        let regions = CACHE_NAMES
            .iter()
            .map(|name| {
                let budget = budgets_mb.get(*name).copied().unwrap_or(DEFAULT_BUDGET_MB);
                Arc::new(CacheRegion::new(name, budget))
            })
            .collect();
        Self {
            regions,
            enabled,
            default_ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Resolve a region by canonical name or route alias (`llm` for
    /// `llm_response`).
    pub fn region(&self, name: &str) -> Result<&Arc<CacheRegion>, ServiceError> {
        let canonical = match name {
            "llm" => "llm_response",
            other => other,
        };
        self.regions
            .iter()
            .find(|r| r.name() == canonical)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "unknown cache type '{name}', expected one of: llm, vector, knowledge_graph, documents, queries"
                ))
            })
    }

    pub fn get(&self, region: &str, key: &str) -> Option<Arc<Vec<u8>>> {
        if !self.enabled {
            return None;
        }
        self.region(region).ok()?.get(key)
    }

    pub fn set(&self, region: &str, key: &str, value: Vec<u8>) -> bool {
        self.set_with_ttl(region, key, value, self.default_ttl)
    }

    pub fn set_with_ttl(&self, region: &str, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        if !self.enabled {
            return false;
        }
        match self.region(region) {
            Ok(r) => r.set(key, value, ttl),
            Err(_) => false,
        }
    }

    /// Clear every cache in the fixed order, then hint the allocator.
    pub fn clear_all(&self) -> ClearReport {
        let mut cleared = Vec::with_capacity(CLEAR_ORDER.len());
        let mut entries = 0u64;
        let mut bytes = 0u64;
        for name in CLEAR_ORDER {
            if let Ok(region) = self.region(name) {
                let (count, freed) = region.clear();
                entries += count;
                bytes += freed;
                cleared.push(name.to_string());
            }
        }
        // Memory-compaction hint: malloc_trim on glibc would go here; the
        // Rust allocator returns freed pages on its own schedule, so the
        // report is what we can promise.
        ClearReport {
            cleared_caches: cleared,
            entries_removed: entries,
            freed_mb: bytes as f64 / (1024.0 * 1024.0),
        }
    }

    pub fn clear_type(&self, name: &str) -> Result<ClearReport, ServiceError> {
        let region = self.region(name)?;
        let (count, bytes) = region.clear();
        Ok(ClearReport {
            cleared_caches: vec![region.name().to_string()],
            entries_removed: count,
            freed_mb: bytes as f64 / (1024.0 * 1024.0),
        })
    }

    pub fn stats_all(&self) -> CoordinatorStats {
        let caches: Vec<CacheRegionStats> = self.regions.iter().map(|r| r.stats()).collect();
        let total_size_mb = caches.iter().map(|c| c.size_mb).sum();
        let (host_total, host_available) = host_memory_mb();
        CoordinatorStats {
            caches,
            total_size_mb,
            process_memory_mb: process_memory_mb(),
            host_memory_total_mb: host_total,
            host_memory_available_mb: host_available,
        }
    }
}

/// Build a fingerprint from request parts: SHA-256 over the parts joined
/// with a separator byte, hex encoded.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

/// Embed one text through the `vector` cache region: identical texts hit
/// the cached vector instead of the embedding service.
pub async fn embed_with_cache(
    caches: &CacheCoordinator,
    embedder: &dyn crate::llm::EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, ragstone_core::ServiceError> {
    use ragstone_core::ServiceError;

    let dim = embedder.dimension();
    let key = fingerprint(&["embed", text]);
    if let Some(bytes) = caches.get("vector", &key) {
        if bytes.len() == dim * 4 {
            return Ok(bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect());
        }
    }

    let mut vectors = embedder.embed(&[text.to_string()]).await?;
    let vector = vectors
        .pop()
        .ok_or_else(|| ServiceError::UpstreamFailure("embedding service returned nothing".into()))?;
    if vector.len() != dim {
        return Err(ServiceError::UpstreamFailure(format!(
            "embedding dimension {} does not match configured {}",
            vector.len(),
            dim
        )));
    }

    let bytes: Vec<u8> = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
    caches.set("vector", &key, bytes);
    Ok(vector)
}

/// Process RSS in MB from /proc; zero on platforms without procfs.
fn process_memory_mb() -> f64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0.0;
    };
    let rss_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (rss_pages * 4096) as f64 / (1024.0 * 1024.0)
}

fn host_memory_mb() -> (f64, f64) {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return (0.0, 0.0);
    };
    let read_kb = |key: &str| -> f64 {
        meminfo
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
            / 1024.0
    };
    (read_kb("MemTotal:"), read_kb("MemAvailable:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> CacheCoordinator {
        CacheCoordinator::new(true, Duration::from_secs(3600), &BTreeMap::new())
    }

    #[test]
    fn test_get_miss_then_hit() {
        let c = coordinator();
        let key = fingerprint(&["what is ai", "hybrid"]);
        assert!(c.get("llm_response", &key).is_none());
        assert!(c.set("llm_response", &key, b"answer".to_vec()));
        assert_eq!(c.get("llm_response", &key).unwrap().as_slice(), b"answer");

        let stats = c.region("llm_response").unwrap().stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_per_entry_ttl_expires() {
        let c = coordinator();
        c.set_with_ttl("queries", "k", b"v".to_vec(), Duration::from_millis(30));
        assert!(c.get("queries", "k").is_some());
        std::thread::sleep(Duration::from_millis(50));
        assert!(c.get("queries", "k").is_none());
    }

    #[test]
    fn test_unknown_cache_type_rejected() {
        let c = coordinator();
        assert!(matches!(
            c.clear_type("sessions"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn test_llm_alias_resolves() {
        let c = coordinator();
        c.set("llm_response", "k", b"v".to_vec());
        let report = c.clear_type("llm").unwrap();
        assert_eq!(report.cleared_caches, vec!["llm_response"]);
        assert_eq!(report.entries_removed, 1);
        assert!(c.get("llm_response", "k").is_none());
    }

    #[test]
    fn test_clear_all_reports_each_region_in_order() {
        let c = coordinator();
        c.set("queries", "q", vec![0u8; 128]);
        c.set("vector", "v", vec![0u8; 256]);
        let report = c.clear_all();
        assert_eq!(
            report.cleared_caches,
            vec!["queries", "documents", "llm_response", "knowledge_graph", "vector"]
        );
        assert_eq!(report.entries_removed, 2);
    }

    #[test]
    fn test_oversize_value_is_refused() {
        let budgets: BTreeMap<String, u64> = [("queries".to_string(), 1u64)].into();
        let c = CacheCoordinator::new(true, Duration::from_secs(10), &budgets);
        // 1 MB budget → anything over 128 KiB refused.
        assert!(!c.set("queries", "big", vec![0u8; 256 * 1024]));
        assert!(c.set("queries", "small", vec![0u8; 1024]));
    }

    #[test]
    fn test_disabled_coordinator_always_misses() {
        let c = CacheCoordinator::new(false, Duration::from_secs(10), &BTreeMap::new());
        assert!(!c.set("queries", "k", b"v".to_vec()));
        assert!(c.get("queries", "k").is_none());
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        assert_ne!(fingerprint(&["a", "b"]), fingerprint(&["b", "a"]));
        assert_eq!(fingerprint(&["a", "b"]), fingerprint(&["a", "b"]));
    }
}
