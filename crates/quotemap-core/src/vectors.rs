//! In-memory working set of quote embeddings for one computation.
//!
//! An [`EmbeddingSet`] is ordered by quote id so every downstream stage
//! (similarity, clustering, projection) sees points in the same stable
//! order, which keeps recomputes deterministic.

use crate::error::{EngineError, Result};
use crate::models::QuoteId;

#[derive(Debug, Clone, Default)]
pub struct EmbeddingSet {
    ids: Vec<QuoteId>,
    vectors: Vec<Vec<f32>>,
    dims: usize,
}

impl EmbeddingSet {
    /// Build a set from `(id, vector)` pairs in any order.
    ///
    /// Fails with [`EngineError::DimensionMismatch`] if the vectors do not
    /// all share one dimension, and with [`EngineError::InvalidParameter`]
    /// on a duplicate id or a zero-length vector.
    pub fn from_pairs(mut pairs: Vec<(QuoteId, Vec<f32>)>) -> Result<Self> {
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let dims = match pairs.first() {
            Some((id, v)) if v.is_empty() => {
                return Err(EngineError::invalid(format!("empty embedding for {}", id)))
            }
            Some((_, v)) => v.len(),
            None => return Ok(Self::default()),
        };

        let mut ids = Vec::with_capacity(pairs.len());
        let mut vectors = Vec::with_capacity(pairs.len());
        for (id, v) in pairs {
            if v.len() != dims {
                return Err(EngineError::DimensionMismatch {
                    id,
                    expected: dims,
                    actual: v.len(),
                });
            }
            if ids.last() == Some(&id) {
                return Err(EngineError::invalid(format!("duplicate quote id {}", id)));
            }
            ids.push(id);
            vectors.push(v);
        }

        Ok(Self { ids, vectors, dims })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Shared dimension D; `0` for an empty set.
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn ids(&self) -> &[QuoteId] {
        &self.ids
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    pub fn vector(&self, index: usize) -> &[f32] {
        &self.vectors[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.binary_search_by(|probe| probe.as_str().cmp(id)).ok()
    }

    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.index_of(id).map(|i| self.vectors[i].as_slice())
    }

    /// L2-normalized copies of every vector, as f64.
    ///
    /// Zero-norm vectors stay zero.
    pub fn normalized(&self) -> Vec<Vec<f64>> {
        self.vectors
            .iter()
            .map(|v| {
                let norm = v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
                if norm > f64::EPSILON {
                    v.iter().map(|x| *x as f64 / norm).collect()
                } else {
                    vec![0.0; v.len()]
                }
            })
            .collect()
    }
}
