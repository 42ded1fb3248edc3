//! Recompute orchestration and similarity queries.
//!
//! [`Engine::recompute`] pulls every stored embedding, runs the similarity
//! index, the clusterer and the projector over the same [`EmbeddingSet`]
//! as one [`ComputeJob`], and hands the resulting [`DerivedSnapshot`] to the
//! store in one atomic call. At most one recompute runs at a time:
//! the in-process [`RecomputeGuard`] rejects a second caller immediately,
//! and the store's lease does the same across processes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{HdbscanClusterer, HdbscanParams};
use crate::embedding::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::materialize::{build_snapshot, SnapshotParts};
use crate::models::{DerivedSnapshot, Neighbor, RecomputeSummary};
use crate::projection::{ProjectionParams, Projector};
use crate::similarity::{validate_threshold, BruteForceIndex, SimilarityIndex, DEFAULT_THRESHOLD};
use crate::store::Store;
use crate::vectors::EmbeddingSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default edge threshold when a recompute does not pass one.
    pub threshold: f64,
    pub clustering: HdbscanParams,
    pub projection: ProjectionParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            clustering: HdbscanParams::default(),
            projection: ProjectionParams::default(),
        }
    }
}

/// Single-flight flag for recomputes within one process.
#[derive(Debug, Default)]
pub struct RecomputeGuard {
    running: AtomicBool,
}

impl RecomputeGuard {
    /// Take the guard, or `None` if a recompute is already running.
    pub fn try_acquire(&self) -> Option<RecomputeLease<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecomputeLease { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Held for the duration of one recompute; releases the guard on drop,
/// including on early return and panic.
#[derive(Debug)]
pub struct RecomputeLease<'a> {
    guard: &'a RecomputeGuard,
}

impl Drop for RecomputeLease<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// The similarity, clustering and projection stages, shareable across
/// threads.
#[derive(Clone)]
struct Pipeline {
    index: Arc<dyn SimilarityIndex>,
    clusterer: HdbscanClusterer,
    projector: Projector,
}

/// The CPU-bound part of one recompute over a fixed embedding snapshot.
///
/// It owns everything it touches, so a runtime can move it onto a
/// blocking thread (see [`Engine::recompute_with`]). [`ComputeJob::run`]
/// never awaits.
pub struct ComputeJob {
    pipeline: Pipeline,
    set: EmbeddingSet,
    run_id: String,
    threshold: f64,
}

impl ComputeJob {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Build the snapshot: edges, labels and coordinates for every quote
    /// in the set.
    pub fn run(self) -> Result<DerivedSnapshot> {
        let ComputeJob {
            pipeline,
            set,
            run_id,
            threshold,
        } = self;

        let t = Instant::now();
        let edges = pipeline.index.edges(&set, threshold)?;
        debug!(edges = edges.len(), elapsed_ms = t.elapsed().as_millis() as u64, "similarity edges computed");

        let t = Instant::now();
        let clusters = pipeline.clusterer.fit(&set);
        debug!(
            clusters = clusters.clusters_found(),
            noise = clusters.noise_count(),
            elapsed_ms = t.elapsed().as_millis() as u64,
            "clustering done"
        );

        let t = Instant::now();
        let layout = pipeline.projector.project(&set);
        debug!(elapsed_ms = t.elapsed().as_millis() as u64, "projection done");

        build_snapshot(SnapshotParts {
            run_id,
            computed_at: chrono::Utc::now().timestamp(),
            threshold,
            set: &set,
            edges,
            clusters: &clusters,
            layout: &layout,
        })
    }
}

pub struct Engine {
    store: Arc<dyn Store>,
    pipeline: Pipeline,
    threshold: f64,
    guard: RecomputeGuard,
}

impl Engine {
    /// Build an engine over `store` with the exact brute-force index.
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Result<Self> {
        Self::with_index(store, Arc::new(BruteForceIndex), config)
    }

    pub fn with_index(
        store: Arc<dyn Store>,
        index: Arc<dyn SimilarityIndex>,
        config: EngineConfig,
    ) -> Result<Self> {
        validate_threshold(config.threshold)?;
        Ok(Self {
            store,
            pipeline: Pipeline {
                index,
                clusterer: HdbscanClusterer::new(config.clustering)?,
                projector: Projector::new(config.projection)?,
            },
            threshold: config.threshold,
            guard: RecomputeGuard::default(),
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn default_threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_recomputing(&self) -> bool {
        self.guard.is_running()
    }

    /// Regenerate edges, cluster labels and coordinates for every stored
    /// quote and replace the previous derived state.
    ///
    /// The compute stages run inline on the calling task. Async callers
    /// that share a runtime with other work should use
    /// [`recompute_with`](Engine::recompute_with) instead.
    pub async fn recompute(&self, threshold: Option<f64>) -> Result<RecomputeSummary> {
        self.recompute_with(threshold, |job| async move { job.run() })
            .await
    }

    /// Like [`recompute`](Engine::recompute), but hands the CPU-bound
    /// [`ComputeJob`] to `offload` (for example a blocking thread pool).
    ///
    /// Fails with [`EngineError::Busy`] if another recompute holds the
    /// lease. On any failure the previous derived state is left as it was.
    pub async fn recompute_with<F, Fut>(
        &self,
        threshold: Option<f64>,
        offload: F,
    ) -> Result<RecomputeSummary>
    where
        F: FnOnce(ComputeJob) -> Fut,
        Fut: Future<Output = Result<DerivedSnapshot>>,
    {
        let threshold = threshold.unwrap_or(self.threshold);
        validate_threshold(threshold)?;

        let _lease = self.guard.try_acquire().ok_or(EngineError::Busy)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let acquired = self
            .store
            .try_acquire_recompute_lease(&run_id)
            .await
            .map_err(EngineError::Store)?;
        if !acquired {
            return Err(EngineError::Busy);
        }

        let result = self.run_pipeline(&run_id, threshold, offload).await;

        if let Err(e) = self.store.release_recompute_lease(&run_id).await {
            warn!(run_id = %run_id, error = %e, "failed to release recompute lease");
        }
        result
    }

    async fn run_pipeline<F, Fut>(
        &self,
        run_id: &str,
        threshold: f64,
        offload: F,
    ) -> Result<RecomputeSummary>
    where
        F: FnOnce(ComputeJob) -> Fut,
        Fut: Future<Output = Result<DerivedSnapshot>>,
    {
        let started = Instant::now();

        let pairs = self
            .store
            .list_quote_embeddings()
            .await
            .map_err(EngineError::Store)?;
        let set = EmbeddingSet::from_pairs(pairs)?;
        info!(run_id, quotes = set.len(), dims = set.dims(), threshold, "recompute started");

        let snapshot = offload(ComputeJob {
            pipeline: self.pipeline.clone(),
            set,
            run_id: run_id.to_string(),
            threshold,
        })
        .await?;

        let run = self
            .store
            .replace_derived_state(&snapshot)
            .await
            .map_err(EngineError::Store)?;

        let summary = RecomputeSummary {
            run_id: run.run_id,
            clusters_found: run.clusters_found,
            edges_created: run.edges_created,
            quotes_processed: run.quotes_processed,
            noise_count: run.noise_count,
            threshold,
        };
        if summary.quotes_processed < snapshot.quotes.len() {
            debug!(
                skipped = snapshot.quotes.len() - summary.quotes_processed,
                "quotes deleted during recompute were not materialized"
            );
        }
        info!(
            run_id,
            clusters = summary.clusters_found,
            edges = summary.edges_created,
            noise = summary.noise_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recompute materialized"
        );
        Ok(summary)
    }

    async fn embedding_of(&self, id: &str) -> Result<Vec<f32>> {
        self.store
            .get_embedding(id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::quote_not_found(id))
    }

    /// Raw cosine similarity in `[-1, 1]` between two stored quotes.
    pub async fn similarity_between(&self, a: &str, b: &str) -> Result<f64> {
        let va = self.embedding_of(a).await?;
        let vb = self.embedding_of(b).await?;
        if va.len() != vb.len() {
            return Err(EngineError::DimensionMismatch {
                id: b.to_string(),
                expected: va.len(),
                actual: vb.len(),
            });
        }
        Ok(cosine_similarity(&va, &vb))
    }

    /// The `top_k` most similar other quotes, computed from current
    /// embeddings (not from the last recompute's edges).
    pub async fn neighbors(&self, id: &str, top_k: usize) -> Result<Vec<Neighbor>> {
        let query = self.embedding_of(id).await?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let pairs = self
            .store
            .list_quote_embeddings()
            .await
            .map_err(EngineError::Store)?;
        let set = EmbeddingSet::from_pairs(pairs)?;
        Ok(self.pipeline.index.neighbors(&set, &query, Some(id), top_k))
    }
}
