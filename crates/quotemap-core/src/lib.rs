//! # Quotemap Core
//!
//! Runtime-agnostic logic for Quotemap: quote and person models, the vector
//! working set, the similarity computer, HDBSCAN density clustering, the
//! 2-D neighborhood-preserving projector, the store abstraction, and the
//! recompute engine that ties them together.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! application crate supplies a concrete [`store::Store`] and
//! [`embedding::Embedder`].
//!
//! ## Recompute pipeline
//!
//! ```text
//! Store::list_quote_embeddings ──▶ EmbeddingSet
//!                                     │
//!            ┌────────────────────────┼────────────────────────┐
//!            ▼                        ▼                        ▼
//!     SimilarityIndex          HdbscanClusterer            Projector
//!       (edges)              (labels, stability)            (x, y)
//!            └────────────────────────┼────────────────────────┘
//!                                     ▼
//!                              DerivedSnapshot ──▶ Store::replace_derived_state
//! ```

pub mod cluster;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod materialize;
pub mod models;
pub mod projection;
pub mod quotes;
pub mod similarity;
pub mod store;
pub mod vectors;

pub use error::{EngineError, Result};
