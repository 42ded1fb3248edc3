//! Storage abstraction for Quotemap.
//!
//! The [`Store`] trait defines every storage operation the quote service,
//! the recompute engine and the read models need, enabling pluggable
//! backends (SQLite in the app crate, [`memory::InMemoryStore`] here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    DerivedSnapshot, Person, Quote, QuoteDerived, QuoteFilter, QuoteId, RunInfo, SimilarityEdge,
};

/// A quote row as written on insert.
#[derive(Debug, Clone)]
pub struct QuoteRecord {
    pub id: QuoteId,
    pub text: String,
    pub context: Option<String>,
    pub source: Option<String>,
    pub person_id: String,
    pub embedding: Vec<f32>,
    pub created_at: i64,
}

/// New text together with its freshly computed embedding. The two are only
/// ever written together.
#[derive(Debug, Clone)]
pub struct Reembedded {
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Partial update of a quote row. `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct QuotePatch {
    pub text: Option<Reembedded>,
    pub context: Option<String>,
    pub source: Option<String>,
    pub person_id: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonCount {
    pub name: String,
    pub quote_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: u32,
    pub quote_count: usize,
    /// Mean similarity of edges with both ends in this cluster; `0` if none.
    pub avg_similarity: f64,
}

/// Aggregate counts over the record store and the current derived state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_quotes: usize,
    pub total_people: usize,
    pub avg_quotes_per_person: f64,
    pub top_people: Vec<PersonCount>,
    pub similarity_edges: usize,
    pub noise_count: usize,
    pub cluster_distribution: Vec<ClusterSummary>,
    pub last_run: Option<RunInfo>,
}

/// Abstract storage backend for Quotemap.
///
/// All operations are async (via `async-trait`). In-memory implementations
/// return immediately-ready futures.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_person`](Store::upsert_person) | Find or create a person by display name |
/// | [`insert_quote`](Store::insert_quote) | Persist a new quote with its embedding |
/// | [`delete_quote`](Store::delete_quote) | Remove a quote, its edges and derived row |
/// | [`list_quote_embeddings`](Store::list_quote_embeddings) | Snapshot of every stored vector |
/// | [`replace_derived_state`](Store::replace_derived_state) | Atomically swap in a recompute's output |
/// | [`try_acquire_recompute_lease`](Store::try_acquire_recompute_lease) | Cross-process single-flight |
#[async_trait]
pub trait Store: Send + Sync {
    /// Return the person with this display name, creating them if unseen.
    async fn upsert_person(&self, name: &str) -> Result<Person>;

    /// Create a person explicitly. `None` if the name is already taken.
    async fn create_person(
        &self,
        name: &str,
        bio: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<Option<Person>>;

    async fn get_person_by_name(&self, name: &str) -> Result<Option<Person>>;

    /// All people ordered by name.
    async fn list_people(&self) -> Result<Vec<Person>>;

    async fn insert_quote(&self, record: &QuoteRecord) -> Result<()>;

    /// Apply a patch. Returns `false` if the quote does not exist.
    async fn update_quote(&self, id: &str, patch: &QuotePatch) -> Result<bool>;

    /// Delete a quote together with its incident edges and derived row.
    /// Returns `false` if the quote did not exist.
    async fn delete_quote(&self, id: &str) -> Result<bool>;

    async fn get_quote(&self, id: &str) -> Result<Option<Quote>>;

    /// Exact-text lookup, used to merge re-ingested quotes.
    async fn find_quote_by_text(&self, text: &str) -> Result<Option<Quote>>;

    /// Quotes newest first, ties by id.
    async fn list_quotes(&self, filter: &QuoteFilter) -> Result<Vec<Quote>>;

    /// Case-insensitive substring match over text, context and author name.
    async fn search_quotes(&self, query: &str, limit: usize) -> Result<Vec<Quote>>;

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>>;

    /// Dimension of the stored vectors, `None` while the store is empty.
    async fn embedding_dims(&self) -> Result<Option<usize>>;

    /// Every `(quote id, embedding)` pair at the time of the call.
    async fn list_quote_embeddings(&self) -> Result<Vec<(QuoteId, Vec<f32>)>>;

    /// Replace all derived rows, edges and the run record in one atomic
    /// step. Rows referencing quotes that no longer exist are skipped; the
    /// returned [`RunInfo`] counts what was written.
    async fn replace_derived_state(&self, snapshot: &DerivedSnapshot) -> Result<RunInfo>;

    /// Current derived rows, ordered by quote id.
    async fn derived_state(&self) -> Result<Vec<QuoteDerived>>;

    /// Current similarity edges, ordered by `(source_id, target_id)`.
    async fn list_similarity_edges(&self) -> Result<Vec<SimilarityEdge>>;

    async fn latest_run(&self) -> Result<Option<RunInfo>>;

    /// Aggregate statistics, listing at most `top_n` people.
    async fn stats(&self, top_n: usize) -> Result<StoreStats> {
        let people = self.list_people().await?;
        let quotes = self.list_quotes(&QuoteFilter::default()).await?;
        let derived = self.derived_state().await?;
        let edges = self.list_similarity_edges().await?;
        let last_run = self.latest_run().await?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for q in &quotes {
            *counts.entry(q.author.name.clone()).or_default() += 1;
        }

        Ok(assemble_stats(
            quotes.len(),
            people.len(),
            counts.into_iter().collect(),
            &derived,
            &edges,
            last_run,
            top_n,
        ))
    }

    /// Take the cross-process recompute lease for `holder`. Backends shared
    /// by a single process can rely on the engine's in-process guard.
    async fn try_acquire_recompute_lease(&self, _holder: &str) -> Result<bool> {
        Ok(true)
    }

    async fn release_recompute_lease(&self, _holder: &str) -> Result<()> {
        Ok(())
    }
}

/// Shared tail of [`Store::stats`]: ranking, averages and the per-cluster
/// distribution.
pub fn assemble_stats(
    total_quotes: usize,
    total_people: usize,
    mut counts: Vec<(String, usize)>,
    derived: &[QuoteDerived],
    edges: &[SimilarityEdge],
    last_run: Option<RunInfo>,
    top_n: usize,
) -> StoreStats {
    counts.retain(|(_, c)| *c > 0);
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(top_n);

    let mut labels: HashMap<&str, u32> = HashMap::new();
    let mut members: BTreeMap<u32, (usize, f64, usize)> = BTreeMap::new();
    let mut noise_count = 0;
    for row in derived {
        match row.cluster_id.id() {
            Some(c) => {
                labels.insert(row.quote_id.as_str(), c);
                members.entry(c).or_default().0 += 1;
            }
            None => noise_count += 1,
        }
    }
    for e in edges {
        if let (Some(a), Some(b)) = (
            labels.get(e.source_id.as_str()),
            labels.get(e.target_id.as_str()),
        ) {
            if a == b {
                let slot = members.entry(*a).or_default();
                slot.1 += e.similarity;
                slot.2 += 1;
            }
        }
    }

    let cluster_distribution = members
        .into_iter()
        .map(|(cluster_id, (quote_count, sum, n))| ClusterSummary {
            cluster_id,
            quote_count,
            avg_similarity: if n > 0 { sum / n as f64 } else { 0.0 },
        })
        .collect();

    StoreStats {
        total_quotes,
        total_people,
        avg_quotes_per_person: if total_people > 0 {
            total_quotes as f64 / total_people as f64
        } else {
            0.0
        },
        top_people: counts
            .into_iter()
            .map(|(name, quote_count)| PersonCount { name, quote_count })
            .collect(),
        similarity_edges: edges.len(),
        noise_count,
        cluster_distribution,
        last_run,
    }
}
