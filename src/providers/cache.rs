//! In-memory LRU embedding memo with TTL, wrapped around any embedder.
//! Key: blake3 hash of (model | text).

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::EmbeddingProvider;
use crate::config::EmbeddingCacheConfig;
use crate::error::ProviderError;
use crate::model::Embedding;

struct CacheEntry {
    embedding: Embedding,
    inserted_at: Instant,
}

pub struct CachedEmbeddings<E> {
    inner: E,
    entries: Mutex<LruCache<[u8; 32], CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<E: EmbeddingProvider> CachedEmbeddings<E> {
    pub fn new(inner: E, config: &EmbeddingCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn compute_key(model: &str, text: &str) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(model.as_bytes());
        hasher.update(b"|");
        hasher.update(text.as_bytes());
        *hasher.finalize().as_bytes()
    }

    fn lookup(&self, key: &[u8; 32]) -> Option<Embedding> {
        let mut cache = self.entries.lock();
        if let Some(entry) = cache.get(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.embedding.clone());
            }
            cache.pop(key);
        }
        None
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl<E: EmbeddingProvider> EmbeddingProvider for CachedEmbeddings<E> {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        let key = Self::compute_key(self.inner.model_name(), text);
        if let Some(hit) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Errors are not memoized.
        let embedding = self.inner.embed(text).await?;
        self.entries.lock().put(
            key,
            CacheEntry {
                embedding: embedding.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(embedding)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for Counting {
        async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Timeout);
            }
            Ok(Embedding::new(vec![text.len() as f32, 1.0]))
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    fn cached(fail: bool, ttl: Duration) -> CachedEmbeddings<Counting> {
        CachedEmbeddings::new(
            Counting {
                calls: AtomicUsize::new(0),
                fail,
            },
            &EmbeddingCacheConfig { capacity: 2, ttl },
        )
    }

    #[tokio::test]
    async fn repeated_text_hits_the_memo() {
        let c = cached(false, Duration::from_secs(60));
        let a = c.embed("hola").await.unwrap();
        let b = c.embed("hola").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(c.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.stats(), (1, 1));
    }

    #[tokio::test]
    async fn capacity_evicts_least_recent() {
        let c = cached(false, Duration::from_secs(60));
        c.embed("a").await.unwrap();
        c.embed("b").await.unwrap();
        c.embed("c").await.unwrap();
        c.embed("a").await.unwrap();
        assert_eq!(c.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let c = cached(false, Duration::ZERO);
        c.embed("hola").await.unwrap();
        c.embed("hola").await.unwrap();
        assert_eq!(c.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let c = cached(true, Duration::from_secs(60));
        assert!(c.embed("x").await.is_err());
        assert!(c.embed("x").await.is_err());
        assert_eq!(c.inner.calls.load(Ordering::SeqCst), 2);
    }
}
