// src/index/flat.rs

//! Brute-force fallback backend: normalized vectors in one contiguous
//! buffer, search is a dot-product scan over every row. Always available;
//! fine for the few thousand records a unit accumulates.

use crate::embed::normalize;

use super::VectorBackend;

pub struct FlatBackend {
    dim: usize,
    data: Vec<f32>,
}

impl FlatBackend {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }
}

impl VectorBackend for FlatBackend {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn add(&mut self, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim);
        let mut row = vector.to_vec();
        normalize(&mut row);
        self.data.extend_from_slice(&row);
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if query.len() != self.dim || self.dim == 0 {
            return Vec::new();
        }
        let mut q = query.to_vec();
        normalize(&mut q);
        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(slot, row)| {
                let dot: f32 = row.iter().zip(&q).map(|(a, b)| a * b).sum();
                (slot, dot)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}
