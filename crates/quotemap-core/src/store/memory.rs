//! In-memory [`Store`] implementation for tests and embedding in other
//! hosts.
//!
//! All state sits behind one `std::sync::RwLock`, so
//! [`replace_derived_state`](Store::replace_derived_state) swaps the whole
//! snapshot under a single write lock.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{
    DerivedSnapshot, Person, Quote, QuoteDerived, QuoteFilter, QuoteId, RunInfo, SimilarityEdge,
};

use super::{QuotePatch, QuoteRecord, Store};

#[derive(Debug, Clone)]
struct StoredQuote {
    text: String,
    context: Option<String>,
    source: Option<String>,
    person_id: String,
    embedding: Vec<f32>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Default)]
struct State {
    people: BTreeMap<String, Person>,
    quotes: BTreeMap<QuoteId, StoredQuote>,
    derived: BTreeMap<QuoteId, QuoteDerived>,
    edges: Vec<SimilarityEdge>,
    run: Option<RunInfo>,
}

impl State {
    fn hydrate(&self, id: &str, q: &StoredQuote) -> Option<Quote> {
        let author = self.people.get(&q.person_id)?.clone();
        let derived = self.derived.get(id);
        Some(Quote {
            id: id.to_string(),
            text: q.text.clone(),
            context: q.context.clone(),
            source: q.source.clone(),
            author,
            cluster_id: derived.and_then(|d| d.cluster_id.id()),
            x: derived.map(|d| d.x),
            y: derived.map(|d| d.y),
            created_at: q.created_at,
            updated_at: q.updated_at,
        })
    }

    fn person_by_name(&self, name: &str) -> Option<&Person> {
        self.people.values().find(|p| p.name == name)
    }

    fn newest_first(&self, mut quotes: Vec<Quote>) -> Vec<Quote> {
        quotes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        quotes
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn new_person(name: &str, bio: Option<&str>, image_url: Option<&str>) -> Person {
    Person {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        bio: bio.map(str::to_string),
        image_url: image_url.map(str::to_string),
        created_at: now(),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_person(&self, name: &str) -> Result<Person> {
        let mut state = self.write()?;
        if let Some(p) = state.person_by_name(name) {
            return Ok(p.clone());
        }
        let person = new_person(name, None, None);
        state.people.insert(person.id.clone(), person.clone());
        Ok(person)
    }

    async fn create_person(
        &self,
        name: &str,
        bio: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<Option<Person>> {
        let mut state = self.write()?;
        if state.person_by_name(name).is_some() {
            return Ok(None);
        }
        let person = new_person(name, bio, image_url);
        state.people.insert(person.id.clone(), person.clone());
        Ok(Some(person))
    }

    async fn get_person_by_name(&self, name: &str) -> Result<Option<Person>> {
        Ok(self.read()?.person_by_name(name).cloned())
    }

    async fn list_people(&self) -> Result<Vec<Person>> {
        let mut people: Vec<Person> = self.read()?.people.values().cloned().collect();
        people.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(people)
    }

    async fn insert_quote(&self, record: &QuoteRecord) -> Result<()> {
        let mut state = self.write()?;
        if state.quotes.contains_key(&record.id) {
            bail!("quote {} already exists", record.id);
        }
        if state.quotes.values().any(|q| q.text == record.text) {
            bail!("a quote with this text already exists");
        }
        if !state.people.contains_key(&record.person_id) {
            bail!("unknown person {}", record.person_id);
        }
        state.quotes.insert(
            record.id.clone(),
            StoredQuote {
                text: record.text.clone(),
                context: record.context.clone(),
                source: record.source.clone(),
                person_id: record.person_id.clone(),
                embedding: record.embedding.clone(),
                created_at: record.created_at,
                updated_at: record.created_at,
            },
        );
        Ok(())
    }

    async fn update_quote(&self, id: &str, patch: &QuotePatch) -> Result<bool> {
        let mut state = self.write()?;
        if !state.quotes.contains_key(id) {
            return Ok(false);
        }
        if let Some(new) = &patch.text {
            if state
                .quotes
                .iter()
                .any(|(other, q)| other != id && q.text == new.text)
            {
                bail!("a quote with this text already exists");
            }
        }
        if let Some(person_id) = &patch.person_id {
            if !state.people.contains_key(person_id) {
                bail!("unknown person {}", person_id);
            }
        }

        let Some(q) = state.quotes.get_mut(id) else {
            return Ok(false);
        };
        if let Some(new) = &patch.text {
            q.text = new.text.clone();
            q.embedding = new.embedding.clone();
        }
        if let Some(context) = &patch.context {
            q.context = Some(context.clone());
        }
        if let Some(source) = &patch.source {
            q.source = Some(source.clone());
        }
        if let Some(person_id) = &patch.person_id {
            q.person_id = person_id.clone();
        }
        q.updated_at = patch.updated_at;
        Ok(true)
    }

    async fn delete_quote(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        if state.quotes.remove(id).is_none() {
            return Ok(false);
        }
        state.derived.remove(id);
        state
            .edges
            .retain(|e| e.source_id != id && e.target_id != id);
        Ok(true)
    }

    async fn get_quote(&self, id: &str) -> Result<Option<Quote>> {
        let state = self.read()?;
        Ok(state.quotes.get(id).and_then(|q| state.hydrate(id, q)))
    }

    async fn find_quote_by_text(&self, text: &str) -> Result<Option<Quote>> {
        let state = self.read()?;
        Ok(state
            .quotes
            .iter()
            .find(|(_, q)| q.text == text)
            .and_then(|(id, q)| state.hydrate(id, q)))
    }

    async fn list_quotes(&self, filter: &QuoteFilter) -> Result<Vec<Quote>> {
        let state = self.read()?;
        let quotes = state
            .quotes
            .iter()
            .filter_map(|(id, q)| state.hydrate(id, q))
            .filter(|q| filter.person.as_ref().map_or(true, |p| &q.author.name == p))
            .filter(|q| filter.cluster_id.map_or(true, |c| q.cluster_id == Some(c)))
            .collect();
        let mut quotes = state.newest_first(quotes);
        if let Some(limit) = filter.limit {
            quotes.truncate(limit);
        }
        Ok(quotes)
    }

    async fn search_quotes(&self, query: &str, limit: usize) -> Result<Vec<Quote>> {
        let needle = query.to_lowercase();
        let state = self.read()?;
        let hits = state
            .quotes
            .iter()
            .filter_map(|(id, q)| state.hydrate(id, q))
            .filter(|q| {
                q.text.to_lowercase().contains(&needle)
                    || q.author.name.to_lowercase().contains(&needle)
                    || q
                        .context
                        .as_ref()
                        .is_some_and(|c| c.to_lowercase().contains(&needle))
            })
            .collect();
        let mut hits = state.newest_first(hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        Ok(self.read()?.quotes.get(id).map(|q| q.embedding.clone()))
    }

    async fn embedding_dims(&self) -> Result<Option<usize>> {
        Ok(self.read()?.quotes.values().next().map(|q| q.embedding.len()))
    }

    async fn list_quote_embeddings(&self) -> Result<Vec<(QuoteId, Vec<f32>)>> {
        Ok(self
            .read()?
            .quotes
            .iter()
            .map(|(id, q)| (id.clone(), q.embedding.clone()))
            .collect())
    }

    async fn replace_derived_state(&self, snapshot: &DerivedSnapshot) -> Result<RunInfo> {
        let mut state = self.write()?;

        let derived: BTreeMap<QuoteId, QuoteDerived> = snapshot
            .quotes
            .iter()
            .filter(|d| state.quotes.contains_key(&d.quote_id))
            .map(|d| (d.quote_id.clone(), d.clone()))
            .collect();
        let edges: Vec<SimilarityEdge> = snapshot
            .edges
            .iter()
            .filter(|e| {
                state.quotes.contains_key(&e.source_id) && state.quotes.contains_key(&e.target_id)
            })
            .cloned()
            .collect();

        let run = RunInfo {
            run_id: snapshot.run_id.clone(),
            computed_at: snapshot.computed_at,
            threshold: snapshot.threshold,
            clusters_found: snapshot.clusters_found,
            edges_created: edges.len(),
            quotes_processed: derived.len(),
            noise_count: derived.values().filter(|d| d.cluster_id.is_noise()).count(),
        };
        state.run = Some(run.clone());
        state.derived = derived;
        state.edges = edges;
        Ok(run)
    }

    async fn derived_state(&self) -> Result<Vec<QuoteDerived>> {
        Ok(self.read()?.derived.values().cloned().collect())
    }

    async fn list_similarity_edges(&self) -> Result<Vec<SimilarityEdge>> {
        Ok(self.read()?.edges.clone())
    }

    async fn latest_run(&self) -> Result<Option<RunInfo>> {
        Ok(self.read()?.run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClusterLabel;

    async fn seed(store: &InMemoryStore, id: &str, text: &str, author: &str, at: i64) {
        let person = store.upsert_person(author).await.unwrap();
        store
            .insert_quote(&QuoteRecord {
                id: id.to_string(),
                text: text.to_string(),
                context: None,
                source: None,
                person_id: person.id,
                embedding: vec![1.0, 0.0],
                created_at: at,
            })
            .await
            .unwrap();
    }

    fn snapshot(ids: &[&str]) -> DerivedSnapshot {
        DerivedSnapshot {
            run_id: "r1".into(),
            computed_at: 10,
            threshold: 0.75,
            clusters_found: 1,
            quotes: ids
                .iter()
                .map(|id| QuoteDerived {
                    quote_id: id.to_string(),
                    cluster_id: ClusterLabel::Cluster(0),
                    x: 0.5,
                    y: 0.5,
                })
                .collect(),
            edges: vec![SimilarityEdge {
                source_id: ids[0].to_string(),
                target_id: ids[1].to_string(),
                similarity: 0.9,
            }],
        }
    }

    #[tokio::test]
    async fn upsert_person_is_idempotent() {
        let store = InMemoryStore::new();
        let a = store.upsert_person("Ada").await.unwrap();
        let b = store.upsert_person("Ada").await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(store.create_person("Ada", None, None).await.unwrap().is_none());
        assert_eq!(store.list_people().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn derived_state_skips_deleted_quotes() {
        let store = InMemoryStore::new();
        seed(&store, "a", "one", "Ada", 1).await;
        seed(&store, "b", "two", "Ada", 2).await;

        store.replace_derived_state(&snapshot(&["a", "c"])).await.unwrap();
        assert_eq!(store.derived_state().await.unwrap().len(), 1);
        assert!(store.list_similarity_edges().await.unwrap().is_empty());

        store.replace_derived_state(&snapshot(&["a", "b"])).await.unwrap();
        let q = store.get_quote("a").await.unwrap().unwrap();
        assert_eq!(q.cluster_id, Some(0));
        assert_eq!(store.list_similarity_edges().await.unwrap().len(), 1);

        assert!(store.delete_quote("b").await.unwrap());
        assert!(store.list_similarity_edges().await.unwrap().is_empty());
        assert_eq!(store.derived_state().await.unwrap().len(), 1);
        assert!(!store.delete_quote("b").await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let store = InMemoryStore::new();
        seed(&store, "a", "Knowledge is power", "Bacon", 1).await;
        seed(&store, "b", "Stay hungry", "Jobs", 2).await;
        seed(&store, "c", "Stay foolish", "Jobs", 3).await;

        let all = store.list_quotes(&QuoteFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let jobs = store
            .list_quotes(&QuoteFilter {
                person: Some("Jobs".into()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "c");

        let hits = store.search_quotes("STAY", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        let hits = store.search_quotes("bacon", 10).await.unwrap();
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn duplicate_text_rejected() {
        let store = InMemoryStore::new();
        seed(&store, "a", "same", "Ada", 1).await;
        let person = store.upsert_person("Ada").await.unwrap();
        let err = store
            .insert_quote(&QuoteRecord {
                id: "b".into(),
                text: "same".into(),
                context: None,
                source: None,
                person_id: person.id,
                embedding: vec![1.0, 0.0],
                created_at: 2,
            })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn stats_counts() {
        let store = InMemoryStore::new();
        seed(&store, "a", "one", "Ada", 1).await;
        seed(&store, "b", "two", "Ada", 2).await;
        seed(&store, "c", "three", "Bob", 3).await;
        store.replace_derived_state(&snapshot(&["a", "b"])).await.unwrap();

        let stats = store.stats(10).await.unwrap();
        assert_eq!(stats.total_quotes, 3);
        assert_eq!(stats.total_people, 2);
        assert!((stats.avg_quotes_per_person - 1.5).abs() < 1e-12);
        assert_eq!(stats.top_people[0].name, "Ada");
        assert_eq!(stats.top_people[0].quote_count, 2);
        assert_eq!(stats.similarity_edges, 1);
        assert_eq!(stats.cluster_distribution.len(), 1);
        assert_eq!(stats.cluster_distribution[0].quote_count, 2);
        assert!((stats.cluster_distribution[0].avg_similarity - 0.9).abs() < 1e-12);
        assert_eq!(stats.last_run.unwrap().edges_created, 1);
    }
}
