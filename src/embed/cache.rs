// src/embed/cache.rs

//! Shared embedding cache: `text_hash -> vector`, one JSON object per line.
//! Consulted before any backend call; invalidated only by explicit purge.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::store::{atomic_write, read_jsonl};

#[derive(Debug, Serialize, Deserialize)]
struct CacheLine {
    text_hash: String,
    vector: Vec<f32>,
}

pub struct EmbeddingCache {
    path: PathBuf,
    entries: HashMap<String, Vec<f32>>,
    dirty: bool,
}

impl EmbeddingCache {
    pub fn load(path: PathBuf) -> Self {
        let entries = read_jsonl::<CacheLine>(&path)
            .unwrap_or_default()
            .into_iter()
            .filter(|line| !line.vector.is_empty())
            .map(|line| (line.text_hash, line.vector))
            .collect::<HashMap<_, _>>();
        debug!(count = entries.len(), "embedding cache loaded");
        Self {
            path,
            entries,
            dirty: false,
        }
    }

    pub fn get(&self, text_hash: &str) -> Option<&Vec<f32>> {
        self.entries.get(text_hash)
    }

    pub fn insert(&mut self, text_hash: String, vector: Vec<f32>) {
        if vector.is_empty() {
            return;
        }
        self.entries.insert(text_hash, vector);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrites the log atomically, sorted by hash for stable diffs.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut rows: Vec<CacheLine> = self
            .entries
            .iter()
            .map(|(hash, vector)| CacheLine {
                text_hash: hash.clone(),
                vector: vector.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.text_hash.cmp(&b.text_hash));
        let mut body = String::new();
        for row in &rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }
        atomic_write(&self.path, body.as_bytes())?;
        self.dirty = false;
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.dirty = true;
        self.flush()
    }
}
