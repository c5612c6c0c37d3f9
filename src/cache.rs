//! Content-addressed translation cache shared by all sessions.
//!
//! Keys are `"{src}:{tgt}:{fingerprint16}"` over normalized source text, so
//! repeated phrases translate once per target language. The backing store is
//! a trait: production can point it at an external table, tests and the
//! default deployment use the in-process [`MemoryStore`]. Caching is
//! advisory — every backing-store failure degrades to a miss or a no-op,
//! never an error on the pipeline path.

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::text::fingerprint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// A cached translation with access metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Plain source text (kept alongside the fingerprint for operability).
    pub source_text: String,
    /// The translation itself.
    pub translated_text: String,
    /// When the entry was stored.
    pub created_at: Instant,
    /// Last lookup hit.
    pub last_accessed_at: Instant,
    /// Number of lookup hits since creation (1 after the first hit).
    pub access_count: u64,
    /// Lazy-eviction deadline.
    pub expires_at: Instant,
}

/// Backing store for cache entries.
///
/// Implementations may be remote; all methods are fallible and the cache
/// treats every failure as advisory.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch an entry by key.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    /// Insert or replace an entry.
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()>;
    /// Remove an entry.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Number of stored entries.
    async fn len(&self) -> Result<usize>;
    /// Access metadata for every entry, for eviction scans.
    async fn scan_meta(&self) -> Result<Vec<CacheEntryMeta>>;
}

/// Eviction-relevant metadata for one entry.
#[derive(Debug, Clone)]
pub struct CacheEntryMeta {
    /// Store key.
    pub key: String,
    /// Lookup hits.
    pub access_count: u64,
    /// Last hit time.
    pub last_accessed_at: Instant,
    /// Lazy-eviction deadline.
    pub expires_at: Instant,
}

/// In-process backing store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|_| PipelineError::Cache("store mutex poisoned".to_owned()))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.lock()?.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    async fn scan_meta(&self) -> Result<Vec<CacheEntryMeta>> {
        Ok(self
            .lock()?
            .iter()
            .map(|(key, entry)| CacheEntryMeta {
                key: key.clone(),
                access_count: entry.access_count,
                last_accessed_at: entry.last_accessed_at,
                expires_at: entry.expires_at,
            })
            .collect())
    }
}

/// Process-wide translation cache.
pub struct TranslationCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    clock: SharedClock,
    metrics: Arc<PipelineMetrics>,
    /// Serializes eviction with concurrent stores so a successful `store`
    /// cannot be undone by a racing eviction scan.
    evict_lock: tokio::sync::Mutex<()>,
}

impl TranslationCache {
    /// Create a cache over the given backing store.
    pub fn new(
        store: Arc<dyn CacheStore>,
        config: CacheConfig,
        clock: SharedClock,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            metrics,
            evict_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Compose the store key for a `(src, tgt, text)` triple.
    #[must_use]
    pub fn cache_key(src: &str, tgt: &str, text: &str) -> String {
        format!("{src}:{tgt}:{}", fingerprint(text))
    }

    /// Look up a cached translation.
    ///
    /// Hits bump the access metadata best-effort; expired entries are
    /// evicted lazily; backing-store errors degrade to a miss.
    pub async fn lookup(&self, src: &str, tgt: &str, text: &str) -> Option<String> {
        let key = Self::cache_key(src, tgt, text);
        let now = self.clock.now();

        let entry = match self.store.get(&key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, "cache lookup failed, treating as miss: {e}");
                PipelineMetrics::incr(&self.metrics.cache_misses);
                return None;
            }
        };

        let Some(mut entry) = entry else {
            PipelineMetrics::incr(&self.metrics.cache_misses);
            return None;
        };

        if entry.expires_at <= now {
            // Lazy TTL eviction; failure to delete is harmless.
            if let Err(e) = self.store.delete(&key).await {
                debug!(key = %key, "failed to drop expired entry: {e}");
            }
            PipelineMetrics::incr(&self.metrics.cache_misses);
            return None;
        }

        PipelineMetrics::incr(&self.metrics.cache_hits);
        let translated = entry.translated_text.clone();

        // Best-effort metadata refresh; two racing hits may both write, the
        // access count still converges upward.
        entry.access_count = entry.access_count.saturating_add(1);
        entry.last_accessed_at = now;
        if let Err(e) = self.store.put(&key, entry).await {
            debug!(key = %key, "failed to update access metadata: {e}");
        }

        Some(translated)
    }

    /// Store a translation, evicting first if the store is at capacity.
    ///
    /// Errors are logged and swallowed: caching is advisory.
    pub async fn store(&self, src: &str, tgt: &str, text: &str, translation: &str) {
        let key = Self::cache_key(src, tgt, text);
        let now = self.clock.now();
        let entry = CacheEntry {
            source_text: text.to_owned(),
            translated_text: translation.to_owned(),
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
            expires_at: now + std::time::Duration::from_secs(self.config.ttl_secs),
        };

        // Hold the eviction lock across the capacity check and the put so a
        // racing eviction cannot remove the entry we just reported stored.
        let _guard = self.evict_lock.lock().await;

        if let Err(e) = self.evict_if_needed(now).await {
            warn!("cache eviction scan failed: {e}");
        }

        if let Err(e) = self.store.put(&key, entry).await {
            warn!(key = %key, "cache store failed: {e}");
        }
    }

    /// Evict `ceil(0.1 · max_entries)` entries when at capacity, least-used
    /// and least-recently-accessed first. Expired entries found during the
    /// scan are removed eagerly and count toward the quota.
    async fn evict_if_needed(&self, now: Instant) -> Result<()> {
        let len = self.store.len().await?;
        if len < self.config.max_entries {
            return Ok(());
        }

        let meta = self.store.scan_meta().await?;
        let quota = self.config.max_entries.div_ceil(10);
        let mut evicted = 0usize;

        // Expired entries go first, eagerly and outside the quota.
        let mut live: Vec<CacheEntryMeta> = Vec::with_capacity(meta.len());
        for item in meta {
            if item.expires_at <= now {
                self.store.delete(&item.key).await?;
                evicted += 1;
            } else {
                live.push(item);
            }
        }

        // Then the least-used, least-recently-accessed survivors.
        live.sort_by(|a, b| {
            a.access_count
                .cmp(&b.access_count)
                .then(a.last_accessed_at.cmp(&b.last_accessed_at))
        });
        for item in live.iter().take(quota.saturating_sub(evicted)) {
            self.store.delete(&item.key).await?;
            evicted += 1;
        }

        if evicted > 0 {
            PipelineMetrics::add(&self.metrics.cache_evictions, evicted as u64);
            debug!(evicted, "cache capacity eviction");
        }
        Ok(())
    }

    /// Current entry count, best-effort.
    pub async fn size(&self) -> usize {
        self.store.len().await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::time::Duration;

    fn cache_with(
        config: CacheConfig,
    ) -> (TranslationCache, ManualClock, Arc<PipelineMetrics>) {
        let clock = ManualClock::new();
        let metrics = PipelineMetrics::new();
        let cache = TranslationCache::new(
            Arc::new(MemoryStore::new()),
            config,
            Arc::new(clock.clone()),
            Arc::clone(&metrics),
        );
        (cache, clock, metrics)
    }

    #[tokio::test]
    async fn store_then_lookup_round_trips() {
        let (cache, _clock, metrics) = cache_with(CacheConfig::default());
        cache.store("en", "es", "hello everyone", "hola a todos").await;
        let hit = cache.lookup("en", "es", "hello everyone").await;
        assert_eq!(hit.as_deref(), Some("hola a todos"));
        assert_eq!(metrics.cache_hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn lookup_normalizes_before_keying() {
        let (cache, _clock, _metrics) = cache_with(CacheConfig::default());
        cache.store("en", "es", "Hello Everyone", "hola a todos").await;
        let hit = cache.lookup("en", "es", "  hello   everyone ").await;
        assert_eq!(hit.as_deref(), Some("hola a todos"));
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let (cache, clock, _metrics) = cache_with(CacheConfig {
            ttl_secs: 10,
            ..CacheConfig::default()
        });
        cache.store("en", "fr", "hello", "bonjour").await;
        clock.advance(Duration::from_secs(11));
        assert!(cache.lookup("en", "fr", "hello").await.is_none());
        // The expired entry was dropped lazily.
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn hits_bump_access_metadata() {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::new());
        let cache = TranslationCache::new(
            Arc::clone(&store) as Arc<dyn CacheStore>,
            CacheConfig::default(),
            Arc::new(clock.clone()),
            PipelineMetrics::new(),
        );

        cache.store("en", "de", "hello", "hallo").await;
        clock.advance(Duration::from_secs(1));
        let _ = cache.lookup("en", "de", "hello").await;
        let _ = cache.lookup("en", "de", "hello").await;

        let meta = store.scan_meta().await.unwrap();
        assert_eq!(meta.len(), 1);
        // 1 at store, +1 per hit.
        assert_eq!(meta[0].access_count, 3);
        assert_eq!(meta[0].last_accessed_at, clock.now());
    }

    #[tokio::test]
    async fn capacity_eviction_prefers_cold_entries() {
        let (cache, clock, metrics) = cache_with(CacheConfig {
            ttl_secs: 3600,
            max_entries: 10,
        });

        for i in 0..10 {
            cache
                .store("en", "es", &format!("phrase {i}"), &format!("frase {i}"))
                .await;
        }
        // Warm up entries 5..10 so 0..5 are the cold candidates.
        clock.advance(Duration::from_secs(1));
        for i in 5..10 {
            assert!(cache.lookup("en", "es", &format!("phrase {i}")).await.is_some());
        }

        // Hits the capacity check: ceil(10 * 0.1) = 1 eviction.
        cache.store("en", "es", "phrase 10", "frase 10").await;
        assert!(metrics.cache_evictions.load(std::sync::atomic::Ordering::Relaxed) >= 1);

        // Warm entries survived.
        for i in 5..10 {
            assert!(
                cache.lookup("en", "es", &format!("phrase {i}")).await.is_some(),
                "warm entry {i} was evicted"
            );
        }
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
            Err(PipelineError::Cache("backend down".to_owned()))
        }
        async fn put(&self, _key: &str, _entry: CacheEntry) -> Result<()> {
            Err(PipelineError::Cache("backend down".to_owned()))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Err(PipelineError::Cache("backend down".to_owned()))
        }
        async fn len(&self) -> Result<usize> {
            Err(PipelineError::Cache("backend down".to_owned()))
        }
        async fn scan_meta(&self) -> Result<Vec<CacheEntryMeta>> {
            Err(PipelineError::Cache("backend down".to_owned()))
        }
    }

    #[tokio::test]
    async fn backing_store_failures_degrade_to_miss() {
        let clock = ManualClock::new();
        let metrics = PipelineMetrics::new();
        let cache = TranslationCache::new(
            Arc::new(FailingStore),
            CacheConfig::default(),
            Arc::new(clock),
            Arc::clone(&metrics),
        );

        // Lookup fails quietly as a miss; store fails quietly as a no-op.
        assert!(cache.lookup("en", "es", "hello").await.is_none());
        cache.store("en", "es", "hello", "hola").await;
        assert_eq!(metrics.cache_misses.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn key_format_is_stable() {
        let key = TranslationCache::cache_key("en", "es", "Hello Everyone");
        assert!(key.starts_with("en:es:"));
        assert_eq!(key.len(), "en:es:".len() + 16);
        // Normalization-insensitive.
        assert_eq!(key, TranslationCache::cache_key("en", "es", " hello   everyone "));
    }
}
