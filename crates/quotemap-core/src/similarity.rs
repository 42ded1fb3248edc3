//! Pairwise similarity over an [`EmbeddingSet`].
//!
//! The [`SimilarityIndex`] trait is the seam between the recompute engine
//! and the neighbor search strategy. [`BruteForceIndex`] does the exact
//! O(n²·D) scan, fanned out over rayon; an approximate index can replace it
//! as long as it honours the same output contract:
//!
//! - every edge satisfies `source_id < target_id` (no self pairs, no
//!   duplicate unordered pairs),
//! - edges are sorted by `(source_id, target_id)`,
//! - an edge exists iff `cosine + SIMILARITY_EPSILON >= threshold`,
//! - stored similarity is clipped to `[0, 1]`.

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::embedding::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::models::{Neighbor, SimilarityEdge};
use crate::vectors::EmbeddingSet;

/// Tolerance applied to threshold comparisons.
pub const SIMILARITY_EPSILON: f64 = 1e-9;

/// Default similarity edge threshold.
pub const DEFAULT_THRESHOLD: f64 = 0.75;

/// Default number of neighbors returned by similar-quote lookups.
pub const DEFAULT_TOP_K: usize = 5;

pub trait SimilarityIndex: Send + Sync {
    /// All unordered pairs whose similarity meets `threshold`.
    fn edges(&self, set: &EmbeddingSet, threshold: f64) -> Result<Vec<SimilarityEdge>>;

    /// The `top_k` quotes most similar to `query`, skipping `exclude`.
    ///
    /// Sorted by similarity descending, ties by quote id ascending.
    /// Similarities are raw cosine values in `[-1, 1]`.
    fn neighbors(
        &self,
        set: &EmbeddingSet,
        query: &[f32],
        exclude: Option<&str>,
        top_k: usize,
    ) -> Vec<Neighbor>;
}

/// Exact full-scan index.
#[derive(Debug, Clone, Copy, Default)]
pub struct BruteForceIndex;

impl SimilarityIndex for BruteForceIndex {
    fn edges(&self, set: &EmbeddingSet, threshold: f64) -> Result<Vec<SimilarityEdge>> {
        validate_threshold(threshold)?;

        let linkable: Vec<bool> = set
            .vectors()
            .iter()
            .map(|v| v.iter().any(|x| *x != 0.0))
            .collect();

        // Ids are sorted, so i < j already gives source_id < target_id and
        // row-major collection gives the sorted edge order.
        let rows: Vec<Vec<SimilarityEdge>> = (0..set.len())
            .into_par_iter()
            .map(|i| {
                if !linkable[i] {
                    return Vec::new();
                }
                let a = set.vector(i);
                ((i + 1)..set.len())
                    .filter(|&j| linkable[j])
                    .filter_map(|j| {
                        let sim = cosine_similarity(a, set.vector(j)).clamp(0.0, 1.0);
                        if sim + SIMILARITY_EPSILON >= threshold {
                            Some(SimilarityEdge {
                                source_id: set.id(i).to_string(),
                                target_id: set.id(j).to_string(),
                                similarity: sim,
                            })
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(rows.into_iter().flatten().collect())
    }

    fn neighbors(
        &self,
        set: &EmbeddingSet,
        query: &[f32],
        exclude: Option<&str>,
        top_k: usize,
    ) -> Vec<Neighbor> {
        if top_k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<Neighbor> = set
            .ids()
            .par_iter()
            .zip(set.vectors().par_iter())
            .filter(|(id, _)| Some(id.as_str()) != exclude)
            .map(|(id, v)| Neighbor {
                quote_id: id.clone(),
                similarity: cosine_similarity(query, v),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.quote_id.cmp(&b.quote_id))
        });
        scored.truncate(top_k);
        scored
    }
}

/// Reject thresholds outside `[0, 1]` and NaN.
pub fn validate_threshold(threshold: f64) -> Result<()> {
    if threshold.is_nan() || !(0.0..=1.0).contains(&threshold) {
        return Err(EngineError::invalid(format!(
            "similarity threshold must be within [0, 1], got {}",
            threshold
        )));
    }
    Ok(())
}
