// src/embed/mod.rs

//! Embedding provider chain: an ordered list of backends tried in priority
//! order. The first that returns vectors of the configured dimension wins;
//! when every tier fails the chain reports `Unavailable`, which callers treat
//! as an expected steady state, not a failure. Vectors are cache-checked by
//! text hash before any backend call.

pub mod cache;
#[cfg(feature = "local-embed")]
pub mod local;
pub mod ollama;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::model::text_hash;

use cache::EmbeddingCache;

/// Uniform capability interface every tier satisfies. Adding a backend means
/// appending a strategy, not branching call sites.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub struct EmbeddingChain {
    backends: Vec<Box<dyn EmbeddingBackend>>,
    cache: Mutex<EmbeddingCache>,
    dim: usize,
    /// Index of the tier that last succeeded; tried first on the next call.
    preferred: AtomicUsize,
}

impl EmbeddingChain {
    pub fn from_config(config: &MemoryConfig, cache_path: PathBuf) -> Self {
        let mut backends: Vec<Box<dyn EmbeddingBackend>> = vec![Box::new(
            ollama::OllamaEmbedder::new(
                &config.ollama_base_url,
                &config.ollama_model,
                config.embed_timeout,
            ),
        )];
        #[cfg(feature = "local-embed")]
        backends.push(Box::new(local::LocalEmbedder::new(config.embed_dim)));

        Self::with_backends(backends, config.embed_dim, cache_path)
    }

    pub fn with_backends(
        backends: Vec<Box<dyn EmbeddingBackend>>,
        dim: usize,
        cache_path: PathBuf,
    ) -> Self {
        Self {
            backends,
            cache: Mutex::new(EmbeddingCache::load(cache_path)),
            dim,
            preferred: AtomicUsize::new(0),
        }
    }

    /// A chain with no tiers; every call degrades. Used by tests and by hosts
    /// that disable semantic recall outright.
    pub fn disabled(dim: usize, cache_path: PathBuf) -> Self {
        Self::with_backends(Vec::new(), dim, cache_path)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Embeds a batch, returning `None` per text the chain could not serve.
    /// Never errors: total unavailability is simply all-`None`.
    pub async fn embed_all(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        if texts.is_empty() {
            return Vec::new();
        }
        let hashes: Vec<String> = texts.iter().map(|t| text_hash(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        let mut miss_indexes = Vec::new();
        let mut miss_texts = Vec::new();
        {
            let cache = self.cache.lock().await;
            for (i, hash) in hashes.iter().enumerate() {
                if let Some(vector) = cache.get(hash) {
                    out[i] = Some(vector.clone());
                } else {
                    miss_indexes.push(i);
                    miss_texts.push(texts[i].clone());
                }
            }
        }

        if miss_texts.is_empty() {
            return out;
        }

        let Some(rows) = self.run_chain(&miss_texts).await else {
            return out;
        };

        let mut cache = self.cache.lock().await;
        for (slot, mut vector) in miss_indexes.into_iter().zip(rows) {
            normalize(&mut vector);
            cache.insert(hashes[slot].clone(), vector.clone());
            out[slot] = Some(vector);
        }
        if let Err(err) = cache.flush() {
            warn!(%err, "embedding cache flush failed");
        }
        out
    }

    /// Embeds one text, `Unavailable` when no tier can serve it.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_all(&[text.to_string()])
            .await
            .pop()
            .flatten()
            .ok_or(MemoryError::Unavailable)
    }

    /// Tries the last-good tier first, then the rest in priority order.
    async fn run_chain(&self, texts: &[String]) -> Option<Vec<Vec<f32>>> {
        if self.backends.is_empty() {
            return None;
        }
        let preferred = self.preferred.load(Ordering::Relaxed).min(self.backends.len() - 1);
        let mut order: Vec<usize> = Vec::with_capacity(self.backends.len());
        order.push(preferred);
        order.extend((0..self.backends.len()).filter(|i| *i != preferred));

        for i in order {
            let backend = &self.backends[i];
            match backend.embed_batch(texts).await {
                Ok(rows) if rows.len() == texts.len() => {
                    if rows.iter().any(|row| row.len() != self.dim) {
                        // Mismatched dimensionality is unavailability for
                        // this call, not an error.
                        debug!(backend = backend.name(), "dimension mismatch, trying next tier");
                        continue;
                    }
                    self.preferred.store(i, Ordering::Relaxed);
                    return Some(rows);
                }
                Ok(_) => {
                    debug!(backend = backend.name(), "short batch, trying next tier");
                }
                Err(_) => {
                    debug!(backend = backend.name(), "tier unavailable");
                }
            }
        }
        None
    }

    pub async fn purge_cache(&self) -> Result<()> {
        self.cache.lock().await.clear()
    }
}

pub(crate) fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic test tier: maps each text to a fixed-dimension vector
    /// derived from its bytes.
    pub struct StubEmbedder {
        pub dim: usize,
    }

    #[async_trait]
    impl EmbeddingBackend for StubEmbedder {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0_f32; self.dim];
                    for (i, b) in t.bytes().enumerate() {
                        v[i % self.dim] += b as f32;
                    }
                    v
                })
                .collect())
        }
    }

    fn cache_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emb_cache.jsonl");
        (dir, path)
    }

    #[tokio::test]
    async fn empty_chain_degrades_to_unavailable() {
        let (_dir, path) = cache_path();
        let chain = EmbeddingChain::disabled(4, path);
        assert!(matches!(
            chain.embed_text("hello").await,
            Err(MemoryError::Unavailable)
        ));
        let all = chain.embed_all(&["a".into(), "b".into()]).await;
        assert!(all.iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn vectors_are_normalized_and_cached() {
        let (_dir, path) = cache_path();
        let chain = EmbeddingChain::with_backends(
            vec![Box::new(StubEmbedder { dim: 4 })],
            4,
            path.clone(),
        );
        let v = chain.embed_text("hello there").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        // Second call is served from the cache even with no backends left.
        let chain2 = EmbeddingChain::disabled(4, path);
        let cached = chain2.embed_text("hello there").await.unwrap();
        assert_eq!(cached, v);
    }

    #[tokio::test]
    async fn mismatched_dimension_is_unavailable() {
        let (_dir, path) = cache_path();
        let chain =
            EmbeddingChain::with_backends(vec![Box::new(StubEmbedder { dim: 3 })], 8, path);
        assert!(matches!(
            chain.embed_text("hello").await,
            Err(MemoryError::Unavailable)
        ));
    }
}
