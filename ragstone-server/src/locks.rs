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

//! Named keyed locks.
//!
//! One lock per opaque name: two holders of the same name serialize
//! regardless of what they intend to do with it (a write fully fences a
//! concurrent read of the same category or knowledge base). Multi-lock
//! acquisition sorts names lexicographically so all multi-lock callers
//! agree on an order and cannot deadlock each other. Every acquisition is
//! bounded by a timeout and reports it as a distinct error.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use ragstone_core::ServiceError;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock name reserved for the QA category-storage creation critical
/// section: guarantees two concurrent writers to a never-seen category
/// produce exactly one storage object.
pub const QA_CATEGORY_INIT: &str = "__qa_category_init__";

#[derive(Debug, Default, Serialize)]
pub struct LockStats {
    pub acquisitions: u64,
    pub timeouts: u64,
    pub active_locks: u64,
}

/// Table of named locks. Entries are created on first use and removed by
/// `sweep` once nothing holds or waits on them.
pub struct KeyedLocks {
    table: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
}

/// Held lock. Dropping releases; the drop order of a `MultiGuard`'s
/// members is reverse acquisition order.
#[derive(Debug)]
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
    name: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Guards for a multi-lock acquisition; drops in reverse order.
pub struct MultiGuard {
    guards: Vec<LockGuard>,
}

impl MultiGuard {
    pub fn names(&self) -> Vec<&str> {
        self.guards.iter().map(|g| g.name()).collect()
    }
}

impl Drop for MultiGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl KeyedLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: DashMap::new(),
            timeout,
            acquisitions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    fn entry(&self, name: &str) -> Arc<Mutex<()>> {
        self.table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the lock for `name`. `purpose` is diagnostic only: it names
    /// the operation in timeout errors and logs, it does not partition the
    /// lock space.
    pub async fn acquire(&self, name: &str, purpose: &str) -> Result<LockGuard, ServiceError> {
        let mutex = self.entry(name);
        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                Ok(LockGuard {
                    _guard: guard,
                    name: name.to_string(),
                })
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(ServiceError::LockTimeout(format!(
                    "'{purpose}' timed out after {:?} waiting for lock '{name}'",
                    self.timeout
                )))
            }
        }
    }

    /// Acquire several named locks in lexicographic order of name
    /// (duplicates collapsed). Release happens in reverse order on drop.
    pub async fn acquire_many(
        &self,
        names: &[String],
        purpose: &str,
    ) -> Result<MultiGuard, ServiceError> {
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for name in sorted {
            // MultiGuard drops already-held locks if a later one times out.
            guards.push(self.acquire(name, purpose).await?);
        }
        Ok(MultiGuard { guards })
    }

    /// Drop table entries nobody is using. Bounded by the table size.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.table.retain(|_, mutex| {
            let unused = Arc::strong_count(mutex) == 1 && mutex.try_lock().is_ok();
            if unused {
                removed += 1;
            }
            !unused
        });
        removed
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            active_locks: self.table.len() as u64,
        }
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

/// Double-checked lazy initialization of a shared slot.
///
/// For any key, at most one `init` completes, and no reader observes a
/// partially initialized value: the value is published into the map only
/// after `init` returned.
pub async fn get_or_init<T, F, Fut>(
    slots: &DashMap<String, Arc<T>>,
    key: &str,
    init_lock_name: &str,
    locks: &KeyedLocks,
    init: F,
) -> Result<Arc<T>, ServiceError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    // Fast path: already published.
    if let Some(existing) = slots.get(key) {
        return Ok(existing.clone());
    }

    let _guard = locks.acquire(init_lock_name, "lazy-init").await?;

    // Second check under the lock: a racing initializer may have won.
    if let Some(existing) = slots.get(key) {
        return Ok(existing.clone());
    }

    let value = Arc::new(init().await?);
    slots.insert(key.to_string(), value.clone());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_same_name_serializes() {
        let locks = Arc::new(KeyedLocks::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("category:tech", "add").await.unwrap();
                let inside = counter.fetch_add(1, Ordering::SeqCst);
                // Nobody else is inside the critical section.
                assert_eq!(inside, 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_different_names_run_concurrently() {
        let locks = Arc::new(KeyedLocks::default());
        let a = locks.acquire("a", "test").await.unwrap();
        // A second, differently named lock must not block behind `a`.
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b", "test"))
            .await
            .expect("lock 'b' should be free")
            .unwrap();
        drop(a);
        drop(b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_as_distinct_error() {
        let locks = Arc::new(KeyedLocks::new(Duration::from_millis(50)));
        let held = locks.acquire("busy", "holder").await.unwrap();

        let err = locks.acquire("busy", "waiter").await.unwrap_err();
        assert!(matches!(err, ServiceError::LockTimeout(_)));
        assert_eq!(locks.stats().timeouts, 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_multi_lock_sorts_and_dedups() {
        let locks = KeyedLocks::default();
        let guard = locks
            .acquire_many(
                &["b".to_string(), "a".to_string(), "b".to_string()],
                "batch",
            )
            .await
            .unwrap();
        assert_eq!(guard.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_crossed_multi_locks_do_not_deadlock() {
        let locks = Arc::new(KeyedLocks::new(Duration::from_secs(5)));
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = locks.clone();
            // Half the tasks ask in one order, half in the other.
            let names = if i % 2 == 0 {
                vec!["x".to_string(), "y".to_string(), "z".to_string()]
            } else {
                vec!["z".to_string(), "x".to_string()]
            };
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire_many(&names, "batch").await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_get_or_init_runs_once_under_race() {
        let slots: Arc<DashMap<String, Arc<String>>> = Arc::new(DashMap::new());
        let locks = Arc::new(KeyedLocks::default());
        let init_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let slots = slots.clone();
            let locks = locks.clone();
            let init_count = init_count.clone();
            handles.push(tokio::spawn(async move {
                get_or_init(&slots, "tech", QA_CATEGORY_INIT, &locks, || async {
                    init_count.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok("storage".to_string())
                })
                .await
                .unwrap()
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }
        assert_eq!(init_count.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| v.as_str() == "storage"));
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_entries_only() {
        let locks = KeyedLocks::default();
        let held = locks.acquire("held", "test").await.unwrap();
        drop(locks.acquire("idle", "test").await.unwrap());

        let removed = locks.sweep();
        assert_eq!(removed, 1);
        assert_eq!(locks.stats().active_locks, 1);
        drop(held);
    }
}
