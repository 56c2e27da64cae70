//! Cache manager.

use super::backend::{CacheEntry, CacheStore};
use super::key::Fingerprint;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Responses larger than this are served but not stored.
    pub max_entry_size: usize,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entry_size: 10 * 1024 * 1024,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub skipped: u64,
    pub swept: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    skipped: AtomicU64,
    swept: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Front of the cache store used by the dispatcher.
///
/// The cache is an optimization: every storage failure is logged, counted
/// and turned into a miss (on read) or a skipped write.
pub struct CacheManager {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    stats: Arc<AtomicStats>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self {
            config,
            store,
            stats: Arc::new(AtomicStats::default()),
        }
    }

    /// Live entry for `fingerprint`; storage errors degrade to a miss.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        if !self.config.enabled {
            return None;
        }
        match self.store.get(fingerprint).await {
            Ok(Some(entry)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(%fingerprint, "cache hit");
                Some(entry)
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(%fingerprint, "cache miss");
                None
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(%fingerprint, error = %e, backend = self.store.name(), "cache read failed, bypassing");
                None
            }
        }
    }

    /// Persist an entry; storage errors are logged and swallowed.
    pub async fn store(&self, entry: CacheEntry) {
        if !self.config.enabled {
            return;
        }
        if entry.size > self.config.max_entry_size {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %entry.fingerprint, size = entry.size, "response too large to cache");
            return;
        }
        let fingerprint = entry.fingerprint.clone();
        match self.store.put(entry).await {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(%fingerprint, error = %e, backend = self.store.name(), "cache write failed, skipping");
            }
        }
    }

    /// Remove expired entries now.
    pub async fn sweep(&self) -> crate::Result<usize> {
        let removed = self.store.sweep(Utc::now()).await?;
        self.stats.swept.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed, backend = self.store.name(), "swept expired cache entries");
        }
        Ok(removed)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.sweep().await {
                    manager.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "periodic cache sweep failed");
                }
            }
        })
    }

    pub async fn len(&self) -> crate::Result<usize> {
        self.store.len().await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::tests::entry;
    use crate::cache::MemoryStore;
    use crate::{Error, ErrorContext, Result};
    use async_trait::async_trait;
    use chrono::DateTime;

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _: &Fingerprint) -> Result<Option<CacheEntry>> {
            Err(Error::cache_unavailable("disk on fire", ErrorContext::new()))
        }
        async fn put(&self, _: CacheEntry) -> Result<()> {
            Err(Error::cache_unavailable("disk on fire", ErrorContext::new()))
        }
        async fn sweep(&self, _: DateTime<Utc>) -> Result<usize> {
            Err(Error::cache_unavailable("disk on fire", ErrorContext::new()))
        }
        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
        async fn clear(&self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_store_failures_degrade_to_miss() {
        let manager = CacheManager::new(CacheConfig::default(), Arc::new(BrokenStore));
        let e = entry("x", Utc::now(), Duration::from_secs(60));
        manager.store(e.clone()).await;
        assert!(manager.lookup(&e.fingerprint).await.is_none());
        assert_eq!(manager.stats().errors, 2);
        assert!(manager.sweep().await.is_err());
    }

    #[tokio::test]
    async fn test_hit_and_miss_counting() {
        let manager = CacheManager::new(CacheConfig::default(), Arc::new(MemoryStore::new(10)));
        let e = entry("y", Utc::now(), Duration::from_secs(60));
        assert!(manager.lookup(&e.fingerprint).await.is_none());
        manager.store(e.clone()).await;
        assert_eq!(manager.lookup(&e.fingerprint).await, Some(e));
        let stats = manager.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[tokio::test]
    async fn test_oversized_entries_are_skipped() {
        let config = CacheConfig::new().with_max_entry_size(4);
        let manager = CacheManager::new(config, Arc::new(MemoryStore::new(10)));
        let e = entry("big", Utc::now(), Duration::from_secs(60));
        manager.store(e.clone()).await;
        assert!(manager.lookup(&e.fingerprint).await.is_none());
        assert_eq!(manager.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_bypassed() {
        let manager = CacheManager::new(
            CacheConfig::new().with_enabled(false),
            Arc::new(MemoryStore::new(10)),
        );
        let e = entry("off", Utc::now(), Duration::from_secs(60));
        manager.store(e.clone()).await;
        assert!(manager.lookup(&e.fingerprint).await.is_none());
        assert_eq!(manager.stats().misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let store = Arc::new(MemoryStore::new(10));
        let manager = Arc::new(CacheManager::new(
            CacheConfig::new().with_sweep_interval(Duration::from_secs(10)),
            store.clone(),
        ));
        store
            .put(entry("gone", Utc::now() - chrono::Duration::seconds(60), Duration::from_secs(1)))
            .await
            .unwrap();

        let handle = manager.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(manager.stats().swept, 1);
        handle.abort();
    }
}
