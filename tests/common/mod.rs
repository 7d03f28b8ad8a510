// tests/common/mod.rs

//! Shared setup for the integration tests: a tempdir-rooted config, a
//! deterministic embedding tier, and a service wired either way.

#![allow(dead_code)]

use std::path::Path;

use async_trait::async_trait;
use keepsake::embed::EmbeddingChain;
use keepsake::{EmbeddingBackend, MemoryConfig, MemoryService};

pub const DIM: usize = 8;

/// Deterministic embedding tier: a text's vector depends only on its bytes,
/// so identical inputs always embed identically.
pub struct StubEmbedder;

#[async_trait]
impl EmbeddingBackend for StubEmbedder {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn embed_batch(&self, texts: &[String]) -> keepsake::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.1_f32; DIM];
                for (i, b) in text.bytes().enumerate() {
                    v[(i + b as usize) % DIM] += b as f32 / 255.0;
                }
                v
            })
            .collect())
    }
}

pub fn test_config(root: &Path) -> MemoryConfig {
    MemoryConfig {
        short_max: 20,
        chunk_turns: 10,
        embed_dim: DIM,
        ..MemoryConfig::at_root(root)
    }
}

/// Service with the deterministic embedding tier.
pub fn service_with_stub(root: &Path) -> MemoryService {
    let config = test_config(root);
    let chain = EmbeddingChain::with_backends(
        vec![Box::new(StubEmbedder)],
        DIM,
        root.join("index").join("emb_cache.jsonl"),
    );
    MemoryService::with_chain(config, chain).unwrap()
}

/// Service with no embedding tiers at all: every call degrades.
pub fn service_degraded(root: &Path) -> MemoryService {
    let config = test_config(root);
    let chain = EmbeddingChain::disabled(DIM, root.join("index").join("emb_cache.jsonl"));
    MemoryService::with_chain(config, chain).unwrap()
}
