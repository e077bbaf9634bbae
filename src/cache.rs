use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::AnalyzerError;
use crate::types::Axis;
use crate::Result;

/// Storage for memoized similarity values with a per-entry lifetime.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<f64>>;
    async fn set(&self, key: &str, value: f64, ttl: Duration) -> Result<()>;
    /// Drops every entry under this backend's prefix, returning how many went.
    async fn clear(&self) -> Result<u64>;
    fn name(&self) -> &'static str;
}

/// Key for an unordered pair of entities on one axis: `axis:min:max`.
pub fn pair_key(axis: Axis, a: i64, b: i64) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}:{}", axis.as_str(), low, high)
}

pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, prefix: String) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Redis cache initialized with prefix: {}", prefix);
        Ok(Self { conn, prefix })
    }

    /// Caps Redis memory and switches it to LRU eviction over all keys.
    pub async fn limit_memory(&self, max_memory: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory")
            .arg(max_memory)
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory-policy")
            .arg("allkeys-lru")
            .query_async::<_, ()>(&mut conn)
            .await?;

        info!("Redis maxmemory set to {} with allkeys-lru", max_memory);
        Ok(())
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(self.make_key(key))
            .query_async::<_, Option<f64>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: f64, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.make_key(key))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = self.make_key("*");
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!("Cleared {} redis keys matching {}", removed, pattern);
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Writes between two sweeps of expired [`MemoryCache`] entries.
const SWEEP_EVERY: u64 = 1024;

/// In-process backend for single-run use and tests.
pub struct MemoryCache {
    data: RwLock<HashMap<String, (f64, DateTime<Utc>)>>,
    prefix: String,
    writes: AtomicU64,
}

impl MemoryCache {
    pub fn new(prefix: String) -> Self {
        info!("Memory cache initialized with prefix: {}", prefix);
        Self {
            data: RwLock::new(HashMap::new()),
            prefix,
            writes: AtomicU64::new(0),
        }
    }

    /// Drops every expired entry, returning how many went.
    pub async fn cleanup_expired(&self) -> usize {
        let mut data = self.data.write().await;
        let now = Utc::now();
        let before = data.len();
        data.retain(|_, (_, expires_at)| now < *expires_at);
        before - data.len()
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn len(&self) -> usize {
        let now = Utc::now();
        let data = self.data.read().await;
        data.values().filter(|(_, expires_at)| now < *expires_at).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<f64>> {
        let cache_key = self.make_key(key);
        let now = Utc::now();

        {
            let data = self.data.read().await;
            match data.get(&cache_key) {
                Some((value, expires_at)) if now < *expires_at => return Ok(Some(*value)),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Entry exists but has expired.
        let mut data = self.data.write().await;
        if matches!(data.get(&cache_key), Some((_, expires_at)) if now >= *expires_at) {
            data.remove(&cache_key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: f64, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AnalyzerError::Config(format!("cache TTL out of range: {}", e)))?;
        let expires_at = Utc::now() + ttl;

        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let removed = self.cleanup_expired().await;
            debug!("Swept {} expired memory cache entries", removed);
        }

        let mut data = self.data.write().await;
        data.insert(self.make_key(key), (value, expires_at));
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let mut data = self.data.write().await;
        let removed = data.len() as u64;
        data.clear();
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub errors: u64,
}

impl CacheStats {
    /// Counters accumulated since `earlier` was taken.
    pub fn since(&self, earlier: &CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            stores: self.stores.saturating_sub(earlier.stores),
            errors: self.errors.saturating_sub(earlier.errors),
        }
    }
}

/// Memoizes pairwise similarities in an optional [`CacheBackend`].
///
/// Every backend call is bounded by `timeout`. A failing or slow backend never
/// fails a lookup: the value is computed directly instead. Concurrent misses
/// for the same pair may each compute and store the value.
pub struct PairwiseCache {
    backend: Option<Arc<dyn CacheBackend>>,
    ttl: Duration,
    timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
    degraded: AtomicBool,
}

impl PairwiseCache {
    pub fn new(backend: Option<Arc<dyn CacheBackend>>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            backend,
            ttl,
            timeout,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn get_or_compute<F>(&self, axis: Axis, a: i64, b: i64, compute: F) -> f64
    where
        F: FnOnce() -> f64,
    {
        let Some(backend) = &self.backend else {
            return compute();
        };

        let key = pair_key(axis, a, b);
        match tokio::time::timeout(self.timeout, backend.get(&key)).await {
            Ok(Ok(Some(value))) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return value;
            }
            Ok(Ok(None)) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.on_error(backend.name(), &key, &e.to_string());
                return compute();
            }
            Err(_) => {
                self.on_error(backend.name(), &key, "timed out");
                return compute();
            }
        }

        let value = compute();
        self.store(backend.as_ref(), &key, value).await;
        value
    }

    async fn store(&self, backend: &dyn CacheBackend, key: &str, value: f64) {
        match tokio::time::timeout(self.timeout, backend.set(key, value, self.ttl)).await {
            Ok(Ok(())) => {
                self.stores.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => self.on_error(backend.name(), key, &e.to_string()),
            Err(_) => self.on_error(backend.name(), key, "timed out"),
        }
    }

    /// Computes the pair and overwrites whatever the backend holds for it.
    pub async fn refresh<F>(&self, axis: Axis, a: i64, b: i64, compute: F) -> f64
    where
        F: FnOnce() -> f64,
    {
        let value = compute();
        if let Some(backend) = &self.backend {
            self.store(backend.as_ref(), &pair_key(axis, a, b), value).await;
        }
        value
    }

    /// Flushes the backend namespace; failures are logged and reported as 0.
    pub async fn clear(&self) -> u64 {
        let Some(backend) = &self.backend else {
            return 0;
        };
        match tokio::time::timeout(self.timeout, backend.clear()).await {
            Ok(Ok(removed)) => {
                info!("Flushed {} cached similarities from {}", removed, backend.name());
                removed
            }
            Ok(Err(e)) => {
                warn!("Failed to flush {} cache: {}", backend.name(), e);
                0
            }
            Err(_) => {
                warn!("Flushing {} cache timed out", backend.name());
                0
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn on_error(&self, backend: &str, key: &str, reason: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                "{} cache unavailable ({}), computing similarities directly",
                backend, reason
            );
        }
        debug!("Cache error on {}: {}", key, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FailingCache;

    #[async_trait]
    impl CacheBackend for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<f64>> {
            Err(AnalyzerError::Config("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: f64, _ttl: Duration) -> Result<()> {
            Err(AnalyzerError::Config("connection refused".to_string()))
        }

        async fn clear(&self) -> Result<u64> {
            Err(AnalyzerError::Config("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    struct StalledCache;

    #[async_trait]
    impl CacheBackend for StalledCache {
        async fn get(&self, _key: &str) -> Result<Option<f64>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: f64, _ttl: Duration) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn clear(&self) -> Result<u64> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[test]
    fn test_pair_key_is_canonical() {
        assert_eq!(pair_key(Axis::Author, 7, 3), "author:3:7");
        assert_eq!(pair_key(Axis::Author, 3, 7), "author:3:7");
        assert_ne!(pair_key(Axis::Title, 3, 7), pair_key(Axis::Author, 3, 7));
    }

    #[tokio::test]
    async fn test_memory_cache_ttl() {
        let cache = MemoryCache::new("test".to_string());

        cache.set("author:1:2", 0.5, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(cache.get("author:1:2").await.unwrap(), Some(0.5));

        cache.set("author:1:3", 0.25, Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("author:1:3").await.unwrap(), None);
        assert_eq!(cache.len().await, 1);

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_cache_sweeps_expired_entries() {
        let cache = MemoryCache::new("test".to_string());
        cache.set("author:1:2", 0.5, Duration::from_secs(3600)).await.unwrap();
        for i in 0..10 {
            cache.set(&format!("author:0:{}", i), 0.1, Duration::ZERO).await.unwrap();
        }
        assert_eq!(cache.data.read().await.len(), 11);
        assert_eq!(cache.cleanup_expired().await, 10);
        assert_eq!(cache.data.read().await.len(), 1);

        for i in 0..SWEEP_EVERY {
            cache.set(&format!("title:0:{}", i), 0.1, Duration::ZERO).await.unwrap();
        }
        assert!(cache.data.read().await.len() < SWEEP_EVERY as usize);
        assert_eq!(cache.get("author:1:2").await.unwrap(), Some(0.5));
    }

    #[tokio::test]
    async fn test_refresh_overwrites_cached_value() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new("test".to_string()));
        let cache = PairwiseCache::new(
            Some(backend.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        cache.get_or_compute(Axis::Author, 1, 2, || 0.75).await;
        assert_eq!(cache.refresh(Axis::Author, 2, 1, || -0.5).await, -0.5);
        assert_eq!(cache.get_or_compute(Axis::Author, 1, 2, || 0.0).await, -0.5);
        assert_eq!(cache.stats().stores, 2);
        assert_eq!(PairwiseCache::disabled().refresh(Axis::Author, 1, 2, || 0.2).await, 0.2);
    }

    #[tokio::test]
    async fn test_miss_computes_once_then_hits() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new("test".to_string()));
        let cache = PairwiseCache::new(
            Some(backend.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_compute(Axis::Author, 1, 2, || {
                calls.fetch_add(1, Ordering::SeqCst);
                0.75
            })
            .await;
        let second = cache
            .get_or_compute(Axis::Author, 2, 1, || {
                calls.fetch_add(1, Ordering::SeqCst);
                -1.0
            })
            .await;

        assert_eq!(first, 0.75);
        assert_eq!(second, 0.75);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.get("author:1:2").await.unwrap(), Some(0.75));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                stores: 1,
                errors: 0
            }
        );
    }

    #[tokio::test]
    async fn test_failing_backend_falls_back_to_compute() {
        let cache = PairwiseCache::new(
            Some(Arc::new(FailingCache) as Arc<dyn CacheBackend>),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        let value = cache.get_or_compute(Axis::Author, 1, 2, || 0.3).await;
        assert_eq!(value, 0.3);
        assert_eq!(cache.stats().errors, 1);
        assert_eq!(cache.clear().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_times_out() {
        let cache = PairwiseCache::new(
            Some(Arc::new(StalledCache) as Arc<dyn CacheBackend>),
            Duration::from_secs(3600),
            Duration::from_millis(50),
        );

        let value = cache.get_or_compute(Axis::Title, 4, 5, || -0.2).await;
        assert_eq!(value, -0.2);
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_computes() {
        let cache = PairwiseCache::disabled();
        assert!(!cache.is_enabled());
        assert_eq!(cache.get_or_compute(Axis::Author, 1, 1, || 0.9).await, 0.9);
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
