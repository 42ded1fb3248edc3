//! Core data models used throughout Quotemap.
//!
//! Quotes and people are the persisted records; [`SimilarityEdge`],
//! [`QuoteDerived`] and [`DerivedSnapshot`] describe the derived state that
//! each recompute produces and replaces wholesale.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque quote identifier (UUID v4 string).
pub type QuoteId = String;

/// An author. Created implicitly the first time a quote names them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub bio: Option<String>,
    pub image_url: Option<String>,
    pub created_at: i64,
}

/// A stored quote, joined with its author and its derived placement.
///
/// `cluster_id`, `x` and `y` mirror the persisted derived-state row. A quote
/// that has never been part of a recompute has all three unset; a quote the
/// last recompute labelled as noise has coordinates but no `cluster_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub text: String,
    pub context: Option<String>,
    pub source: Option<String>,
    pub author: Person,
    pub cluster_id: Option<u32>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Quote {
    /// The derived placement, if the quote was part of the last recompute.
    pub fn placement(&self) -> Option<(ClusterLabel, f64, f64)> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some((ClusterLabel::from(self.cluster_id), x, y)),
            _ => None,
        }
    }
}

/// Input for creating a quote. The author is referenced by display name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewQuote {
    pub text: String,
    pub author: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Partial update of a quote. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteUpdate {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Cluster assignment of one quote in one recompute.
///
/// `Noise` is the reserved "unclustered" label; real clusters are numbered
/// `0..k` and never collide with it. Persisted as a nullable integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum ClusterLabel {
    Noise,
    Cluster(u32),
}

impl ClusterLabel {
    pub fn is_noise(&self) -> bool {
        matches!(self, ClusterLabel::Noise)
    }

    pub fn id(&self) -> Option<u32> {
        match self {
            ClusterLabel::Noise => None,
            ClusterLabel::Cluster(id) => Some(*id),
        }
    }
}

impl From<Option<u32>> for ClusterLabel {
    fn from(value: Option<u32>) -> Self {
        value.map_or(ClusterLabel::Noise, ClusterLabel::Cluster)
    }
}

impl From<ClusterLabel> for Option<u32> {
    fn from(label: ClusterLabel) -> Self {
        label.id()
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterLabel::Noise => write!(f, "noise"),
            ClusterLabel::Cluster(id) => write!(f, "{}", id),
        }
    }
}

/// Undirected similarity relation, stored once with `source_id < target_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub source_id: QuoteId,
    pub target_id: QuoteId,
    /// Cosine similarity clipped to `[0, 1]`.
    pub similarity: f64,
}

/// Derived placement of one quote: cluster label plus 2-D layout position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteDerived {
    pub quote_id: QuoteId,
    pub cluster_id: ClusterLabel,
    pub x: f64,
    pub y: f64,
}

/// Everything one recompute produces. Replaces the previous snapshot as a
/// single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedSnapshot {
    pub run_id: String,
    pub computed_at: i64,
    pub threshold: f64,
    pub clusters_found: usize,
    pub quotes: Vec<QuoteDerived>,
    pub edges: Vec<SimilarityEdge>,
}

/// Bookkeeping row for a materialized recompute. Counts describe the rows
/// actually written, not the snapshot handed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub computed_at: i64,
    pub threshold: f64,
    pub clusters_found: usize,
    pub edges_created: usize,
    pub quotes_processed: usize,
    pub noise_count: usize,
}

/// Result of [`Engine::recompute`](crate::engine::Engine::recompute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecomputeSummary {
    pub run_id: String,
    pub clusters_found: usize,
    pub edges_created: usize,
    pub quotes_processed: usize,
    pub noise_count: usize,
    pub threshold: f64,
}

/// One entry of a nearest-neighbor answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub quote_id: QuoteId,
    pub similarity: f64,
}

/// Filter for listing quotes.
#[derive(Debug, Clone, Default)]
pub struct QuoteFilter {
    /// Exact author display name.
    pub person: Option<String>,
    pub cluster_id: Option<u32>,
    pub limit: Option<usize>,
}
