//! Batching cache
//!
//! Deduplicates identical reads within one logical request. The first load of
//! a key starts the work as a shared future; every later load of the same key,
//! in flight or settled, awaits that same future. Failed loads are evicted so a
//! retry reaches the driver again. Writes clear the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::Output;
use crate::config::CacheConfig;
use crate::error::ResolverResult;
use crate::query::Query;

type Pending = Shared<BoxFuture<'static, ResolverResult<Output>>>;

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Loads answered by an existing entry
    pub hits: u64,
    /// Loads that started new work
    pub misses: u64,
    /// Entries dropped because their load failed
    pub evictions: u64,
    /// Entries currently held
    pub entries: usize,
}

/// Request-scoped read cache
pub struct BatchCache {
    config: CacheConfig,
    entries: Arc<Mutex<HashMap<String, Pending>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl std::fmt::Debug for BatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BatchCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cache key of a read: sha-256 of its canonical identity
    pub fn key(query: &Query) -> String {
        let canonical = json!({
            "method": query.method(),
            "model": query.model(),
            "query": query.cache_key(),
        });
        format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Share the entry for `key`, or start `fetch` and remember it
    pub fn load<F>(&self, key: String, fetch: F) -> BoxFuture<'static, ResolverResult<Output>>
    where
        F: FnOnce() -> BoxFuture<'static, ResolverResult<Output>>,
    {
        if !self.config.enabled {
            return fetch();
        }

        let mut entries = self.lock();
        if let Some(pending) = entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache hit");
            return pending.clone().boxed();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if entries.len() >= self.config.max_entries {
            drop(entries);
            debug!(key = %key, "cache full, loading uncached");
            return fetch();
        }

        let pending = fetch().shared();
        entries.insert(key.clone(), pending.clone());
        drop(entries);
        debug!(key = %key, "cache miss");

        let map = Arc::clone(&self.entries);
        let evictions = Arc::clone(&self.evictions);
        async move {
            let result = pending.clone().await;
            if result.is_err() {
                let mut entries = map.lock().unwrap_or_else(|e| e.into_inner());
                let current = entries.get(&key).map(|p| p.ptr_eq(&pending)).unwrap_or(false);
                if current {
                    entries.remove(&key);
                    evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            result
        }
        .boxed()
    }

    /// Forget one key
    pub fn clear(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Forget every key
    pub fn clear_all(&self) {
        let mut entries = self.lock();
        if !entries.is_empty() {
            debug!(entries = entries.len(), "cache cleared");
        }
        entries.clear();
    }

    /// Seed a key with a known result; existing entries win
    pub fn prime(&self, key: String, value: Output) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, future::ready(Ok(value)).boxed().shared());
        true
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolverError;
    use crate::query::Method;
    use std::sync::atomic::AtomicUsize;

    fn counting(calls: &Arc<AtomicUsize>, value: u64) -> BoxFuture<'static, ResolverResult<Output>> {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Output::Count(value))
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_work() {
        let cache = BatchCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let a = cache.load("k".to_string(), || counting(&calls, 7));
        let b = cache.load("k".to_string(), || counting(&calls, 9));
        let (a, b) = futures_util::join!(a, b);

        assert_eq!(a.unwrap(), Output::Count(7));
        assert_eq!(b.unwrap(), Output::Count(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_clear_forces_reload() {
        let cache = BatchCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        cache.load("k".to_string(), || counting(&calls, 1)).await.unwrap();
        cache.clear_all();
        cache.load("k".to_string(), || counting(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(cache.clear("k"));
        assert!(!cache.clear("k"));
    }

    #[tokio::test]
    async fn test_failed_load_is_evicted() {
        let cache = BatchCache::new(CacheConfig::default());
        let failing = || {
            async { Err::<Output, _>(ResolverError::driver("down")) }.boxed()
        };

        assert!(cache.load("k".to_string(), failing).await.is_err());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().evictions, 1);

        let calls = Arc::new(AtomicUsize::new(0));
        cache.load("k".to_string(), || counting(&calls, 2)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_passes_through() {
        let cache = BatchCache::new(CacheConfig::disabled());
        let calls = Arc::new(AtomicUsize::new(0));

        cache.load("k".to_string(), || counting(&calls, 1)).await.unwrap();
        cache.load("k".to_string(), || counting(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.prime("k".to_string(), Output::Count(1)));
    }

    #[tokio::test]
    async fn test_prime() {
        let cache = BatchCache::new(CacheConfig::default());
        assert!(cache.prime("k".to_string(), Output::Count(5)));
        assert!(!cache.prime("k".to_string(), Output::Count(6)));

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache.load("k".to_string(), || counting(&calls, 1)).await.unwrap();
        assert_eq!(value, Output::Count(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_key_is_stable() {
        let a = Query::new("Person", Method::Find)
            .filter(serde_json::json!({"b": 1, "a": 2}))
            .unwrap();
        let b = Query::new("Person", Method::Find)
            .filter(serde_json::json!({"a": 2, "b": 1}))
            .unwrap();
        assert_eq!(BatchCache::key(&a), BatchCache::key(&b));
        assert_eq!(BatchCache::key(&a).len(), 64);

        let count = a.clone().with_method(Method::Count);
        assert_ne!(BatchCache::key(&a), BatchCache::key(&count));
    }
}
