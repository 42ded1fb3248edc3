//! Assemble one recompute's outputs into a [`DerivedSnapshot`].
//!
//! The snapshot is what [`Store::replace_derived_state`](crate::store::Store::replace_derived_state)
//! swaps in as a single unit.

use crate::cluster::ClusterAssignment;
use crate::error::{EngineError, Result};
use crate::models::{DerivedSnapshot, QuoteDerived, SimilarityEdge};
use crate::projection::Point2;
use crate::vectors::EmbeddingSet;

pub struct SnapshotParts<'a> {
    pub run_id: String,
    pub computed_at: i64,
    pub threshold: f64,
    pub set: &'a EmbeddingSet,
    pub edges: Vec<SimilarityEdge>,
    pub clusters: &'a ClusterAssignment,
    pub layout: &'a [Point2],
}

/// Zip labels and coordinates onto quote ids. Every stage must have
/// produced exactly one row per quote.
pub fn build_snapshot(parts: SnapshotParts<'_>) -> Result<DerivedSnapshot> {
    let n = parts.set.len();
    if parts.clusters.labels.len() != n || parts.layout.len() != n {
        return Err(EngineError::invalid(format!(
            "stage output size mismatch: {} quotes, {} labels, {} coordinates",
            n,
            parts.clusters.labels.len(),
            parts.layout.len()
        )));
    }

    let quotes = parts
        .set
        .ids()
        .iter()
        .zip(parts.clusters.labels.iter())
        .zip(parts.layout.iter())
        .map(|((id, label), point)| QuoteDerived {
            quote_id: id.clone(),
            cluster_id: *label,
            x: point[0],
            y: point[1],
        })
        .collect();

    Ok(DerivedSnapshot {
        run_id: parts.run_id,
        computed_at: parts.computed_at,
        threshold: parts.threshold,
        clusters_found: parts.clusters.clusters_found(),
        quotes,
        edges: parts.edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClusterLabel;

    #[test]
    fn zips_rows_in_set_order() {
        let set = EmbeddingSet::from_pairs(vec![
            ("b".to_string(), vec![0.0, 1.0]),
            ("a".to_string(), vec![1.0, 0.0]),
        ])
        .unwrap();
        let clusters = ClusterAssignment {
            labels: vec![ClusterLabel::Cluster(0), ClusterLabel::Noise],
            probabilities: vec![1.0, 0.0],
            stabilities: vec![3.0],
        };
        let layout = [[0.0, 0.25], [1.0, 0.75]];
        let snapshot = build_snapshot(SnapshotParts {
            run_id: "run".into(),
            computed_at: 7,
            threshold: 0.5,
            set: &set,
            edges: Vec::new(),
            clusters: &clusters,
            layout: &layout,
        })
        .unwrap();

        assert_eq!(snapshot.clusters_found, 1);
        assert_eq!(snapshot.quotes[0].quote_id, "a");
        assert_eq!(snapshot.quotes[0].cluster_id, ClusterLabel::Cluster(0));
        assert_eq!(snapshot.quotes[1].quote_id, "b");
        assert!(snapshot.quotes[1].cluster_id.is_noise());
        assert_eq!(snapshot.quotes[1].y, 0.75);
    }

    #[test]
    fn rejects_mismatched_stage_output() {
        let set = EmbeddingSet::from_pairs(vec![("a".to_string(), vec![1.0])]).unwrap();
        let clusters = ClusterAssignment::default();
        let result = build_snapshot(SnapshotParts {
            run_id: "run".into(),
            computed_at: 0,
            threshold: 0.75,
            set: &set,
            edges: Vec::new(),
            clusters: &clusters,
            layout: &[[0.5, 0.5]],
        });
        assert!(result.is_err());
    }
}
