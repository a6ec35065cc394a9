//! Content-addressed embedding cache.
//!
//! Keys are `xxh3_128(model_id, normalized_text)`. The store is injected
//! behind [`EmbeddingStore`]; [`EmbeddingCache::get_or_compute`] is the only
//! way the pipeline obtains vectors.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::embedding::{EmbeddingError, EmbeddingProvider};
use crate::util::text::cache_key;

pub type CacheKey = u128;

/// Shared immutable vector.
pub type Vector = Arc<[f32]>;

/// Lookup counters for one call or for the lifetime of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Positions served from the store.
    pub hits: usize,
    /// Positions not in the store.
    pub misses: usize,
    /// Distinct texts sent to the provider.
    pub computed: usize,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.hits as f64 / total as f64;
        rate
    }

    #[must_use]
    pub fn combined(self, other: Self) -> Self {
        Self {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            computed: self.computed + other.computed,
        }
    }
}

/// One stored vector.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingCacheEntry {
    pub cache_key: CacheKey,
    pub vector: Vector,
    pub model_id: String,
}

/// Storage behind the cache. Writes for an existing key are no-ops.
#[async_trait]
pub trait EmbeddingStore: Send + Sync + fmt::Debug {
    /// Looks up `keys` under `model_id`, positionally aligned.
    async fn get_many(&self, model_id: &str, keys: &[CacheKey]) -> Vec<Option<Vector>>;

    /// Stores entries. Entries for a different model than the one currently
    /// held replace the whole store.
    async fn put_many(&self, entries: Vec<EmbeddingCacheEntry>);

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Default)]
struct StoreState {
    model_id: Option<String>,
    entries: FxHashMap<CacheKey, Vector>,
}

/// Process-local store holding a single model generation.
#[derive(Debug, Default)]
pub struct InMemoryEmbeddingStore {
    state: RwLock<StoreState>,
}

impl InMemoryEmbeddingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Model whose vectors are currently held.
    pub async fn model_id(&self) -> Option<String> {
        self.state.read().await.model_id.clone()
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryEmbeddingStore {
    async fn get_many(&self, model_id: &str, keys: &[CacheKey]) -> Vec<Option<Vector>> {
        let state = self.state.read().await;
        if state.model_id.as_deref() != Some(model_id) {
            return vec![None; keys.len()];
        }
        keys.iter()
            .map(|key| state.entries.get(key).cloned())
            .collect()
    }

    async fn put_many(&self, entries: Vec<EmbeddingCacheEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        for entry in entries {
            if state.model_id.as_deref() != Some(entry.model_id.as_str()) {
                debug!(
                    previous = ?state.model_id,
                    model = %entry.model_id,
                    dropped = state.entries.len(),
                    "embedding model changed, invalidating cache"
                );
                state.entries.clear();
                state.model_id = Some(entry.model_id.clone());
            }
            state.entries.entry(entry.cache_key).or_insert(entry.vector);
        }
    }

    async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

const DEFAULT_BATCH_SIZE: usize = 256;
const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Get-or-compute front end combining a provider and a store.
pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn EmbeddingStore>,
    batch_size: usize,
    max_concurrency: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
    computed: AtomicUsize,
}

impl fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("provider", &self.provider)
            .field("store", &self.store)
            .field("batch_size", &self.batch_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("stats", &self.stats())
            .finish()
    }
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, store: Arc<dyn EmbeddingStore>) -> Self {
        Self {
            provider,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            computed: AtomicUsize::new(0),
        }
    }

    /// Convenience constructor with a fresh [`InMemoryEmbeddingStore`].
    pub fn in_memory(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::new(provider, Arc::new(InMemoryEmbeddingStore::new()))
    }

    /// Texts per provider call and provider calls in flight. Zero is treated as one.
    #[must_use]
    pub fn with_batching(mut self, batch_size: usize, max_concurrency: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn EmbeddingStore> {
        &self.store
    }

    /// Totals over every call made through this cache.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
        }
    }

    /// Returns one vector per text, in input order, computing and storing the
    /// ones not cached yet. Each distinct uncached text is embedded once.
    ///
    /// # Errors
    /// Propagates provider failures unchanged. Returns
    /// [`EmbeddingError::Malformed`] when the provider returns the wrong number
    /// of vectors or a vector of the wrong length, and
    /// [`EmbeddingError::Configuration`] when `model_id` is not the provider's model.
    pub async fn get_or_compute(
        &self,
        texts: &[String],
        model_id: &str,
    ) -> Result<(Vec<Vector>, CacheStats), EmbeddingError> {
        if model_id != self.provider.model_id() {
            return Err(EmbeddingError::Configuration(format!(
                "model {model_id} requested but provider serves {}",
                self.provider.model_id()
            )));
        }

        let keys: Vec<CacheKey> = texts.iter().map(|text| cache_key(model_id, text)).collect();
        let mut slots = self.store.get_many(model_id, &keys).await;

        let mut pending_index: FxHashMap<CacheKey, usize> = FxHashMap::default();
        let mut pending_keys = Vec::new();
        let mut pending_texts = Vec::new();
        let mut stats = CacheStats::default();
        for ((key, text), slot) in keys.iter().zip(texts).zip(&slots) {
            if slot.is_some() {
                stats.hits += 1;
                continue;
            }
            stats.misses += 1;
            pending_index.entry(*key).or_insert_with(|| {
                pending_keys.push(*key);
                pending_texts.push(text.clone());
                pending_texts.len() - 1
            });
        }
        stats.computed = pending_texts.len();

        debug!(
            model = %model_id,
            total = texts.len(),
            hits = stats.hits,
            misses = stats.misses,
            computed = stats.computed,
            "embedding cache lookup"
        );

        if !pending_texts.is_empty() {
            let computed = self.compute(&pending_texts).await?;
            let vectors: Vec<Vector> = computed.into_iter().map(Vector::from).collect();

            let entries = pending_keys
                .iter()
                .zip(&vectors)
                .map(|(key, vector)| EmbeddingCacheEntry {
                    cache_key: *key,
                    vector: Arc::clone(vector),
                    model_id: model_id.to_string(),
                })
                .collect();
            self.store.put_many(entries).await;

            for (slot, key) in slots.iter_mut().zip(&keys) {
                if slot.is_none() {
                    *slot = pending_index.get(key).map(|&i| Arc::clone(&vectors[i]));
                }
            }
        }

        self.hits.fetch_add(stats.hits, Ordering::Relaxed);
        self.misses.fetch_add(stats.misses, Ordering::Relaxed);
        self.computed.fetch_add(stats.computed, Ordering::Relaxed);

        let vectors = slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| EmbeddingError::Malformed("missing vector".to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((vectors, stats))
    }

    async fn compute(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let provider = &self.provider;
        let dimension = provider.dimension();

        let batches: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(self.batch_size))
            .map(|chunk| async move {
                let vectors = provider.embed(chunk).await?;
                if vectors.len() != chunk.len() {
                    return Err(EmbeddingError::Malformed(format!(
                        "expected {} vectors, got {}",
                        chunk.len(),
                        vectors.len()
                    )));
                }
                if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
                    return Err(EmbeddingError::Malformed(format!(
                        "expected dimension {dimension}, got {}",
                        bad.len()
                    )));
                }
                Ok(vectors)
            })
            .buffered(self.max_concurrency)
            .try_collect()
            .await?;

        Ok(batches.into_iter().flatten().collect())
    }
}
