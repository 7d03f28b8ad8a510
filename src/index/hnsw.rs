// src/index/hnsw.rs

//! Optimized ANN backend (feature `hnsw`). The graph lives in memory and is
//! derived state: it is rebuilt from the persisted vector blob on load,
//! never serialized or hand-edited itself.

use hnsw_rs::prelude::*;

use super::VectorBackend;

const MAX_CONNECTIONS: usize = 16;
const CAPACITY_HINT: usize = 10_000;
const MAX_LAYERS: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 64;

pub struct HnswBackend {
    dim: usize,
    graph: Hnsw<'static, f32, DistCosine>,
    count: usize,
}

impl HnswBackend {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            graph: Self::fresh_graph(),
            count: 0,
        }
    }

    fn fresh_graph() -> Hnsw<'static, f32, DistCosine> {
        Hnsw::new(
            MAX_CONNECTIONS,
            CAPACITY_HINT,
            MAX_LAYERS,
            EF_CONSTRUCTION,
            DistCosine {},
        )
    }
}

impl VectorBackend for HnswBackend {
    fn name(&self) -> &'static str {
        "hnsw"
    }

    fn add(&mut self, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim);
        let row = vector.to_vec();
        self.graph.insert((&row, self.count));
        self.count += 1;
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if query.len() != self.dim || self.count == 0 {
            return Vec::new();
        }
        self.graph
            .search(query, k.min(self.count), EF_SEARCH)
            .into_iter()
            .map(|n| (n.d_id, 1.0 - n.distance))
            .collect()
    }

    fn len(&self) -> usize {
        self.count
    }

    fn clear(&mut self) {
        self.graph = Self::fresh_graph();
        self.count = 0;
    }
}
