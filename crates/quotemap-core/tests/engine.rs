//! Recompute engine behavior against the in-memory store.
//!
//! `TestStore` wraps [`InMemoryStore`] with hooks for failing
//! materialization, pausing inside a recompute, inserting or deleting a
//! quote mid-run, and refusing the cross-process lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use quotemap_core::engine::{ComputeJob, Engine, EngineConfig};
use quotemap_core::models::{
    DerivedSnapshot, Person, Quote, QuoteDerived, QuoteFilter, QuoteId, RunInfo, SimilarityEdge,
};
use quotemap_core::store::memory::InMemoryStore;
use quotemap_core::store::{QuotePatch, QuoteRecord, Store};
use quotemap_core::EngineError;

#[derive(Default)]
struct TestStore {
    inner: InMemoryStore,
    fail_replace: AtomicBool,
    deny_lease: AtomicBool,
    insert_after_list: Mutex<Option<QuoteRecord>>,
    delete_after_list: Mutex<Option<String>>,
    pause: Option<(Arc<Notify>, Arc<Notify>)>,
}

#[async_trait]
impl Store for TestStore {
    async fn upsert_person(&self, name: &str) -> Result<Person> {
        self.inner.upsert_person(name).await
    }
    async fn create_person(
        &self,
        name: &str,
        bio: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<Option<Person>> {
        self.inner.create_person(name, bio, image_url).await
    }
    async fn get_person_by_name(&self, name: &str) -> Result<Option<Person>> {
        self.inner.get_person_by_name(name).await
    }
    async fn list_people(&self) -> Result<Vec<Person>> {
        self.inner.list_people().await
    }
    async fn insert_quote(&self, record: &QuoteRecord) -> Result<()> {
        self.inner.insert_quote(record).await
    }
    async fn update_quote(&self, id: &str, patch: &QuotePatch) -> Result<bool> {
        self.inner.update_quote(id, patch).await
    }
    async fn delete_quote(&self, id: &str) -> Result<bool> {
        self.inner.delete_quote(id).await
    }
    async fn get_quote(&self, id: &str) -> Result<Option<Quote>> {
        self.inner.get_quote(id).await
    }
    async fn find_quote_by_text(&self, text: &str) -> Result<Option<Quote>> {
        self.inner.find_quote_by_text(text).await
    }
    async fn list_quotes(&self, filter: &QuoteFilter) -> Result<Vec<Quote>> {
        self.inner.list_quotes(filter).await
    }
    async fn search_quotes(&self, query: &str, limit: usize) -> Result<Vec<Quote>> {
        self.inner.search_quotes(query, limit).await
    }
    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        self.inner.get_embedding(id).await
    }
    async fn embedding_dims(&self) -> Result<Option<usize>> {
        self.inner.embedding_dims().await
    }
    async fn list_quote_embeddings(&self) -> Result<Vec<(QuoteId, Vec<f32>)>> {
        let snapshot = self.inner.list_quote_embeddings().await?;
        if let Some((entered, release)) = &self.pause {
            entered.notify_one();
            release.notified().await;
        }
        if let Some(record) = self.insert_after_list.lock().await.take() {
            self.inner.insert_quote(&record).await?;
        }
        if let Some(id) = self.delete_after_list.lock().await.take() {
            self.inner.delete_quote(&id).await?;
        }
        Ok(snapshot)
    }
    async fn replace_derived_state(&self, snapshot: &DerivedSnapshot) -> Result<RunInfo> {
        if self.fail_replace.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.replace_derived_state(snapshot).await
    }
    async fn derived_state(&self) -> Result<Vec<QuoteDerived>> {
        self.inner.derived_state().await
    }
    async fn list_similarity_edges(&self) -> Result<Vec<SimilarityEdge>> {
        self.inner.list_similarity_edges().await
    }
    async fn latest_run(&self) -> Result<Option<RunInfo>> {
        self.inner.latest_run().await
    }
    async fn try_acquire_recompute_lease(&self, _holder: &str) -> Result<bool> {
        Ok(!self.deny_lease.load(Ordering::SeqCst))
    }
}

async fn record(store: &dyn Store, id: &str, vector: Vec<f32>) -> QuoteRecord {
    let person = store.upsert_person("Anon").await.unwrap();
    QuoteRecord {
        id: id.to_string(),
        text: format!("quote {id}"),
        context: None,
        source: None,
        person_id: person.id,
        embedding: vector,
        created_at: 0,
    }
}

async fn insert(store: &dyn Store, id: &str, vector: Vec<f32>) {
    let r = record(store, id, vector).await;
    store.insert_quote(&r).await.unwrap();
}

async fn seed_scenario(store: &dyn Store) {
    insert(store, "q1", vec![1.0, 0.0, 0.0]).await;
    insert(store, "q2", vec![0.99, 0.1, 0.0]).await;
    insert(store, "q3", vec![0.0, 0.0, 1.0]).await;
}

fn engine(store: Arc<TestStore>) -> Engine {
    Engine::new(store, EngineConfig::default()).unwrap()
}

#[tokio::test]
async fn empty_store_recomputes_to_zero() {
    let store = Arc::new(TestStore::default());
    let summary = engine(store.clone()).recompute(None).await.unwrap();
    assert_eq!(summary.clusters_found, 0);
    assert_eq!(summary.edges_created, 0);
    assert_eq!(summary.quotes_processed, 0);
    assert!(store.latest_run().await.unwrap().is_some());
}

#[tokio::test]
async fn near_duplicates_linked_and_clustered() {
    let store = Arc::new(TestStore::default());
    seed_scenario(store.as_ref()).await;

    let summary = engine(store.clone()).recompute(Some(0.75)).await.unwrap();
    assert_eq!(summary.edges_created, 1);
    assert_eq!(summary.clusters_found, 1);
    assert_eq!(summary.noise_count, 1);
    assert_eq!(summary.quotes_processed, 3);

    let edges = store.list_similarity_edges().await.unwrap();
    assert_eq!((edges[0].source_id.as_str(), edges[0].target_id.as_str()), ("q1", "q2"));

    let q1 = store.get_quote("q1").await.unwrap().unwrap();
    let q2 = store.get_quote("q2").await.unwrap().unwrap();
    let q3 = store.get_quote("q3").await.unwrap().unwrap();
    assert_eq!(q1.cluster_id, Some(0));
    assert_eq!(q2.cluster_id, Some(0));
    assert_eq!(q3.cluster_id, None);
    for q in [&q1, &q2, &q3] {
        let (x, y) = (q.x.unwrap(), q.y.unwrap());
        assert!((0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y));
    }
}

#[tokio::test]
async fn recompute_is_deterministic_and_idempotent() {
    let store = Arc::new(TestStore::default());
    for i in 0..12 {
        let t = i as f32 * 0.4;
        insert(store.as_ref(), &format!("q{i:02}"), vec![t.sin(), t.cos(), (i % 4) as f32 * 0.3]).await;
    }
    let engine = engine(store.clone());

    let first = engine.recompute(None).await.unwrap();
    let derived = store.derived_state().await.unwrap();
    let edges = store.list_similarity_edges().await.unwrap();

    let second = engine.recompute(None).await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.clusters_found, second.clusters_found);
    assert_eq!(first.edges_created, second.edges_created);
    assert_eq!(store.derived_state().await.unwrap(), derived);
    assert_eq!(store.list_similarity_edges().await.unwrap(), edges);

    let snapshot = DerivedSnapshot {
        run_id: "fixed".into(),
        computed_at: 1,
        threshold: 0.75,
        clusters_found: first.clusters_found,
        quotes: derived.clone(),
        edges: edges.clone(),
    };
    store.replace_derived_state(&snapshot).await.unwrap();
    store.replace_derived_state(&snapshot).await.unwrap();
    assert_eq!(store.derived_state().await.unwrap(), derived);
    assert_eq!(store.list_similarity_edges().await.unwrap(), edges);
}

#[tokio::test]
async fn failed_materialization_keeps_prior_state() {
    let store = Arc::new(TestStore::default());
    seed_scenario(store.as_ref()).await;
    let engine = engine(store.clone());

    engine.recompute(None).await.unwrap();
    let derived = store.derived_state().await.unwrap();
    let run = store.latest_run().await.unwrap();

    insert(store.as_ref(), "q4", vec![0.0, 0.05, 1.0]).await;
    store.fail_replace.store(true, Ordering::SeqCst);
    let err = engine.recompute(None).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));

    assert_eq!(store.derived_state().await.unwrap(), derived);
    assert_eq!(store.latest_run().await.unwrap(), run);
    assert!(!engine.is_recomputing());

    store.fail_replace.store(false, Ordering::SeqCst);
    assert_eq!(engine.recompute(None).await.unwrap().quotes_processed, 4);
}

#[tokio::test]
async fn quote_created_mid_run_appears_next_run() {
    let store = Arc::new(TestStore::default());
    seed_scenario(store.as_ref()).await;
    let late = record(store.as_ref(), "q0", vec![0.98, 0.12, 0.0]).await;
    *store.insert_after_list.lock().await = Some(late);
    let engine = engine(store.clone());

    let first = engine.recompute(None).await.unwrap();
    assert_eq!(first.quotes_processed, 3);
    let q0 = store.get_quote("q0").await.unwrap().unwrap();
    assert!(q0.x.is_none() && q0.cluster_id.is_none());
    assert!(store
        .list_similarity_edges()
        .await
        .unwrap()
        .iter()
        .all(|e| e.source_id != "q0" && e.target_id != "q0"));

    let second = engine.recompute(None).await.unwrap();
    assert_eq!(second.quotes_processed, 4);
    let edges = store.list_similarity_edges().await.unwrap();
    assert!(edges.iter().any(|e| e.source_id == "q0" && e.target_id == "q1"));
    let q0 = store.get_quote("q0").await.unwrap().unwrap();
    assert!(q0.x.is_some());
}

#[tokio::test]
async fn quote_deleted_mid_run_is_not_counted() {
    let store = Arc::new(TestStore::default());
    seed_scenario(store.as_ref()).await;
    *store.delete_after_list.lock().await = Some("q2".to_string());
    let engine = engine(store.clone());

    let summary = engine.recompute(None).await.unwrap();
    let edges = store.list_similarity_edges().await.unwrap();
    let run = store.latest_run().await.unwrap().unwrap();

    assert!(edges.is_empty());
    assert_eq!(summary.edges_created, edges.len());
    assert_eq!(summary.quotes_processed, 2);
    assert_eq!(summary.noise_count, 1);
    assert_eq!(summary.edges_created, run.edges_created);
    assert_eq!(summary.quotes_processed, run.quotes_processed);
    assert_eq!(store.derived_state().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compute_stage_can_run_on_blocking_pool() {
    let store = Arc::new(TestStore::default());
    seed_scenario(store.as_ref()).await;
    let engine = engine(store.clone());

    let seen = Arc::new(AtomicBool::new(false));
    let flag = seen.clone();
    let summary = engine
        .recompute_with(None, move |job: ComputeJob| async move {
            assert_eq!(job.len(), 3);
            flag.store(true, Ordering::SeqCst);
            tokio::task::spawn_blocking(move || job.run()).await.unwrap()
        })
        .await
        .unwrap();

    assert!(seen.load(Ordering::SeqCst));
    assert_eq!(summary.edges_created, 1);
    assert_eq!(summary.clusters_found, 1);
    assert_eq!(store.derived_state().await.unwrap().len(), 3);
    assert!(!engine.is_recomputing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_recompute_is_rejected() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let store = Arc::new(TestStore {
        pause: Some((entered.clone(), release.clone())),
        ..TestStore::default()
    });
    seed_scenario(store.as_ref()).await;
    let engine = Arc::new(engine(store.clone()));

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.recompute(None).await })
    };
    entered.notified().await;
    assert!(engine.is_recomputing());

    let err = engine.recompute(None).await.unwrap_err();
    assert!(matches!(err, EngineError::Busy));
    assert_eq!(err.to_string(), "recompute already running");

    release.notify_one();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.quotes_processed, 3);
    assert!(!engine.is_recomputing());
}

#[tokio::test]
async fn store_lease_refusal_is_busy() {
    let store = Arc::new(TestStore::default());
    store.deny_lease.store(true, Ordering::SeqCst);
    let engine = engine(store.clone());
    assert!(matches!(engine.recompute(None).await, Err(EngineError::Busy)));
    assert!(!engine.is_recomputing());
    assert!(store.latest_run().await.unwrap().is_none());
}

#[tokio::test]
async fn mixed_dimensions_fail_recompute() {
    let store = Arc::new(TestStore::default());
    insert(store.as_ref(), "a", vec![1.0, 0.0]).await;
    insert(store.as_ref(), "b", vec![1.0, 0.0, 0.0]).await;
    let err = engine(store).recompute(None).await.unwrap_err();
    assert!(matches!(err, EngineError::DimensionMismatch { .. }));
}

#[tokio::test]
async fn invalid_threshold_rejected_without_taking_guard() {
    let store = Arc::new(TestStore::default());
    let engine = engine(store);
    assert!(matches!(
        engine.recompute(Some(1.01)).await,
        Err(EngineError::InvalidParameter(_))
    ));
    assert!(engine.recompute(Some(0.0)).await.is_ok());
}

#[tokio::test]
async fn similarity_and_neighbor_queries() {
    let store = Arc::new(TestStore::default());
    seed_scenario(store.as_ref()).await;
    let engine = engine(store);

    let s = engine.similarity_between("q1", "q2").await.unwrap();
    assert!(s > 0.99 && s <= 1.0);
    assert!((engine.similarity_between("q1", "q3").await.unwrap()).abs() < 1e-9);
    assert!(matches!(
        engine.similarity_between("q1", "missing").await,
        Err(EngineError::NotFound { .. })
    ));

    let n = engine.neighbors("q1", 5).await.unwrap();
    let ids: Vec<_> = n.iter().map(|x| x.quote_id.as_str()).collect();
    assert_eq!(ids, vec!["q2", "q3"]);
    assert!(engine.neighbors("q1", 0).await.unwrap().is_empty());
    assert!(matches!(
        engine.neighbors("missing", 5).await,
        Err(EngineError::NotFound { .. })
    ));
}
