// src/index/mod.rs

//! Per-unit vector index. Two interchangeable backends satisfy the same
//! contract — an ANN graph when the `hnsw` feature is active, a brute-force
//! cosine scan otherwise — selected once at startup and invisible to the
//! retrieval engine. The mapping (vector slot → source record) is a JSONL
//! line-log; the vectors themselves persist as an opaque per-unit blob.

pub mod flat;
#[cfg(feature = "hnsw")]
pub mod hnsw;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::embed::EmbeddingChain;
use crate::error::Result;
use crate::model::{text_hash, IndexSource, LongTermRecord, UnitId};
use crate::store::DurableStore;

/// One line of the per-unit mapping log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub vector_id: String,
    pub unit: String,
    pub source_ref: String,
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

/// Stable id for a vector: hash of the source ref and the source text, so a
/// rebuild over unchanged records reproduces the same ids.
pub fn vector_id(source_ref: &str, text: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", source_ref, text_hash(text)).as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Similarity-structure contract shared by both backends. Slots are dense
/// and assigned in insertion order; the caller owns the slot → record map.
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn add(&mut self, vector: &[f32]);
    /// Top-k `(slot, cosine_similarity)` pairs, best first.
    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)>;
    fn len(&self) -> usize;
    fn clear(&mut self);
}

fn select_backend(dim: usize) -> Box<dyn VectorBackend> {
    #[cfg(feature = "hnsw")]
    {
        Box::new(hnsw::HnswBackend::new(dim))
    }
    #[cfg(not(feature = "hnsw"))]
    {
        Box::new(flat::FlatBackend::new(dim))
    }
}

pub struct UnitIndex {
    unit: UnitId,
    dim: usize,
    records: Vec<IndexRecord>,
    vectors: Vec<Vec<f32>>,
    backend: Box<dyn VectorBackend>,
}

impl UnitIndex {
    pub fn new(unit: UnitId, dim: usize) -> Self {
        let backend = select_backend(dim);
        debug!(unit = %unit, engine = backend.name(), "unit index created");
        Self {
            unit,
            dim,
            records: Vec::new(),
            vectors: Vec::new(),
            backend,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.vectors.clear();
        self.backend.clear();
    }

    /// Adds one embedded source. The caller guarantees the vector dimension.
    pub fn add(&mut self, source: &IndexSource, vector: Vec<f32>) {
        if vector.len() != self.dim {
            return;
        }
        self.records.push(IndexRecord {
            vector_id: vector_id(&source.source_ref, &source.text),
            unit: self.unit.stem(),
            source_ref: source.source_ref.clone(),
            kind: source.kind.clone(),
            text: source.text.clone(),
            tags: source.tags.clone(),
            importance: source.importance,
            created_at: source.created_at,
        });
        self.backend.add(&vector);
        self.vectors.push(vector);
    }

    /// Top-k records by cosine similarity; similarity ties broken by most
    /// recent `created_at` first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(IndexRecord, f32)> {
        let mut hits: Vec<(IndexRecord, f32)> = self
            .backend
            .search(query, k)
            .into_iter()
            .filter_map(|(slot, similarity)| {
                self.records.get(slot).map(|r| (r.clone(), similarity))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.created_at.cmp(&a.0.created_at))
        });
        hits.truncate(k);
        hits
    }

    /// Loads the mapping and blob from disk. Returns false when the blob is
    /// missing or disagrees with the mapping — searches stay empty until the
    /// next rebuild heals the index.
    pub fn load(&mut self, store: &DurableStore) -> Result<bool> {
        self.clear();
        let records = store.read_mapping(&self.unit)?;
        match store.read_vectors(&self.unit)? {
            Some((dim, rows)) if dim == self.dim && rows.len() == records.len() => {
                for row in &rows {
                    self.backend.add(row);
                }
                self.vectors = rows;
                self.records = records;
                Ok(true)
            }
            _ => {
                if !records.is_empty() {
                    debug!(unit = %self.unit, "index mapping present but vectors stale");
                }
                Ok(false)
            }
        }
    }

    pub fn persist(&self, store: &DurableStore) -> Result<()> {
        store.write_mapping(&self.unit, &self.records)?;
        store.write_vectors(&self.unit, self.dim, &self.vectors)
    }

    /// Recomputes the index from the unit's current long-term record and
    /// discards the prior index entirely. Idempotent; records the chain
    /// cannot embed are left out (a later rebuild picks them up).
    pub async fn rebuild(
        &mut self,
        chain: &EmbeddingChain,
        record: &LongTermRecord,
    ) -> usize {
        let sources = record.index_sources();
        if sources.is_empty() {
            self.clear();
            return 0;
        }
        let texts: Vec<String> = sources.iter().map(|s| s.text.clone()).collect();
        // Embed before touching the index: the await is the only suspension
        // point, so a dropped rebuild leaves the prior index intact.
        let vectors = chain.embed_all(&texts).await;
        self.clear();
        let mut added = 0;
        for (source, vector) in sources.iter().zip(vectors) {
            if let Some(vector) = vector {
                self.add(source, vector);
                added += 1;
            }
        }
        info!(unit = %self.unit, added, skipped = sources.len() - added, "index rebuilt");
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_utc;

    fn source(refname: &str, text: &str) -> IndexSource {
        IndexSource {
            source_ref: refname.to_string(),
            kind: "chunk".to_string(),
            text: text.to_string(),
            tags: vec![],
            importance: 0.5,
            created_at: now_utc(),
        }
    }

    #[test]
    fn vector_id_is_stable_for_unchanged_source() {
        assert_eq!(vector_id("fact:1", "the smith"), vector_id("fact:1", "The  Smith"));
        assert_ne!(vector_id("fact:1", "the smith"), vector_id("fact:2", "the smith"));
    }

    #[test]
    fn add_search_persist_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::new(dir.path()).unwrap();
        let unit = UnitId::npc("p", "smith");

        let mut index = UnitIndex::new(unit.clone(), 3);
        index.add(&source("chunk:1", "fight at the bridge"), vec![1.0, 0.0, 0.0]);
        index.add(&source("chunk:2", "trade at the market"), vec![0.0, 1.0, 0.0]);

        let hits = index.search(&[1.0, 0.0, 0.0], 1);
        assert_eq!(hits[0].0.source_ref, "chunk:1");

        index.persist(&store).unwrap();
        let mut reloaded = UnitIndex::new(unit, 3);
        assert!(reloaded.load(&store).unwrap());
        let hits = reloaded.search(&[1.0, 0.0, 0.0], 1);
        assert_eq!(hits[0].0.source_ref, "chunk:1");
    }

    #[test]
    fn stale_blob_leaves_index_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::new(dir.path()).unwrap();
        let unit = UnitId::npc("p", "smith");

        let mut index = UnitIndex::new(unit.clone(), 3);
        index.add(&source("chunk:1", "one"), vec![1.0, 0.0, 0.0]);
        store.write_mapping(&unit, index.records()).unwrap();
        // No vector blob written: mapping alone must not produce hits.

        let mut reloaded = UnitIndex::new(unit, 3);
        assert!(!reloaded.load(&store).unwrap());
        assert!(reloaded.search(&[1.0, 0.0, 0.0], 1).is_empty());
    }
}
