//! Bounded cache for artifacts that are expensive to load.
//!
//! Executors load models, decoders and similar artifacts by key. The cache
//! keeps at most `capacity` of them and evicts the least recently used one
//! when full. Values are usually `Arc<T>` so a hit is a cheap clone.
//!
//! A [`JobRunner`](crate::runner::JobRunner) owns one [`SharedArtifacts`]
//! cache and hands it to every step through the step context.

use std::any::Any;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;

use crate::config::JobsConfig;
use crate::error::ConfigError;

/// How often (in lookups) to emit a cache statistics log line.
const STATS_LOG_EVERY_N: u64 = 100;

/// A type-erased artifact, recovered with [`ArtifactCache::get_or_load_as`].
pub type Artifact = Arc<dyn Any + Send + Sync>;

/// The cache a runner shares with its executors, keyed by artifact name.
pub type SharedArtifacts = ArtifactCache<String, Artifact>;

/// Hit and miss counts since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

pub struct ArtifactCache<K, V> {
    /// Never held while a loader runs.
    entries: Mutex<LruCache<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> ArtifactCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| ConfigError::InvalidValue {
            key: "artifact_cache_capacity".to_string(),
            message: "must be greater than 0".to_string(),
        })?;
        Ok(Self::with_capacity(capacity))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a cache sized by `artifact_cache_capacity`.
    pub fn from_config(config: &JobsConfig) -> Result<Self, ConfigError> {
        Self::new(config.artifact_cache_capacity)
    }

    /// Cached value for `key`, marking it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.lock().get(key).cloned();
        self.record(value.is_some());
        value
    }

    pub fn insert(&self, key: K, value: V) {
        if let Some((evicted, _)) = self.lock().push(key.clone(), value)
            && evicted != key
        {
            tracing::debug!("Artifact cache full, evicted least recently used entry");
        }
    }

    /// Return the cached value for `key`, loading and caching it on a miss.
    ///
    /// Loader errors are returned as-is and nothing is cached. Two callers
    /// missing on the same key at once may both run the loader; the last
    /// one to finish wins.
    pub fn get_or_load<E>(&self, key: &K, load: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = load()?;
        self.insert(key.clone(), value.clone());
        Ok(value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: entries.len(),
            capacity: entries.cap().get(),
        }
    }

    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);

        let total = self.hits.load(Ordering::Relaxed) + self.misses.load(Ordering::Relaxed);
        if total.is_multiple_of(STATS_LOG_EVERY_N) {
            let stats = self.stats();
            tracing::debug!(
                hits = stats.hits,
                misses = stats.misses,
                len = stats.len,
                capacity = stats.capacity,
                "Artifact cache stats"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<K, V>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SharedArtifacts {
    /// Typed [`get_or_load`](Self::get_or_load) over type-erased artifacts.
    ///
    /// An entry cached under `key` with a different type is replaced by the
    /// freshly loaded value.
    pub fn get_or_load_as<T, E>(
        &self,
        key: &str,
        load: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
    {
        let key = key.to_string();
        if let Some(cached) = self.get(&key) {
            match cached.downcast::<T>() {
                Ok(value) => return Ok(value),
                Err(_) => tracing::debug!(key = %key, "Cached artifact has another type, reloading"),
            }
        }
        let value = Arc::new(load()?);
        self.insert(key, value.clone());
        Ok(value)
    }
}

impl<K, V> std::fmt::Debug for ArtifactCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ArtifactCache")
            .field("len", &stats.len)
            .field("capacity", &stats.capacity)
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .finish()
    }
}
