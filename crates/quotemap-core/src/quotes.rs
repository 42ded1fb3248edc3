//! Quote ingestion, editing and removal.
//!
//! Every write that changes quote text embeds first and persists second, so
//! an unavailable embedding provider leaves the store untouched. Authors are
//! referenced by display name and created on first use.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::error::{EngineError, Result};
use crate::models::{NewQuote, Quote, QuoteUpdate};
use crate::store::{QuotePatch, QuoteRecord, Reembedded, Store};

/// Outcome of a bulk import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub merged: usize,
    pub failed: Vec<ImportFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    /// Position in the input list.
    pub index: usize,
    pub error: String,
}

/// Whether [`QuoteService::create`] inserted a new quote or merged into an
/// existing one with identical text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Merged,
}

#[derive(Clone)]
pub struct QuoteService {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
}

fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::Store(e)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn non_blank(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

impl QuoteService {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Create a quote, or merge into the existing quote with the same text.
    pub async fn create(&self, input: NewQuote) -> Result<Quote> {
        self.create_with_outcome(input).await.map(|(q, _)| q)
    }

    pub async fn create_with_outcome(&self, input: NewQuote) -> Result<(Quote, CreateOutcome)> {
        let text = non_blank(&input.text, "text")?;
        let author = non_blank(&input.author, "author")?;

        let embedding = self
            .embedder
            .embed(&text)
            .await
            .map_err(EngineError::Embedding)?;
        self.persist(text, author, input.context, input.source, embedding)
            .await
    }

    async fn persist(
        &self,
        text: String,
        author: String,
        context: Option<String>,
        source: Option<String>,
        embedding: Vec<f32>,
    ) -> Result<(Quote, CreateOutcome)> {
        if let Some(existing) = self.store.find_quote_by_text(&text).await.map_err(store_err)? {
            debug!(quote_id = %existing.id, "merging quote with identical text");
            let person = self.store.upsert_person(&author).await.map_err(store_err)?;
            let patch = QuotePatch {
                text: None,
                context,
                source,
                person_id: Some(person.id),
                updated_at: now(),
            };
            self.store
                .update_quote(&existing.id, &patch)
                .await
                .map_err(store_err)?;
            let quote = self.get(&existing.id).await?;
            return Ok((quote, CreateOutcome::Merged));
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.check_dims(&id, &embedding).await?;
        let person = self.store.upsert_person(&author).await.map_err(store_err)?;
        let record = QuoteRecord {
            id,
            text,
            context,
            source,
            person_id: person.id,
            embedding,
            created_at: now(),
        };
        self.store.insert_quote(&record).await.map_err(store_err)?;
        debug!(quote_id = %record.id, "quote created");
        let quote = self.get(&record.id).await?;
        Ok((quote, CreateOutcome::Created))
    }

    async fn check_dims(&self, id: &str, embedding: &[f32]) -> Result<()> {
        if embedding.is_empty() {
            return Err(EngineError::Embedding(anyhow::anyhow!(
                "embedding provider returned an empty vector"
            )));
        }
        if let Some(expected) = self.store.embedding_dims().await.map_err(store_err)? {
            if expected != embedding.len() {
                return Err(EngineError::DimensionMismatch {
                    id: id.to_string(),
                    expected,
                    actual: embedding.len(),
                });
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Quote> {
        self.store
            .get_quote(id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| EngineError::quote_not_found(id))
    }

    /// Apply an edit. Changed text is re-embedded before anything is
    /// written; on embedding failure the old text and vector stay.
    pub async fn update(&self, id: &str, update: QuoteUpdate) -> Result<Quote> {
        let current = self.get(id).await?;

        let text = match update.text {
            Some(t) => {
                let t = non_blank(&t, "text")?;
                if t != current.text {
                    if let Some(other) = self.store.find_quote_by_text(&t).await.map_err(store_err)? {
                        return Err(EngineError::invalid(format!(
                            "quote {} already has this text",
                            other.id
                        )));
                    }
                    let embedding = self.embedder.embed(&t).await.map_err(EngineError::Embedding)?;
                    self.check_dims(id, &embedding).await?;
                    Some(Reembedded { text: t, embedding })
                } else {
                    None
                }
            }
            None => None,
        };

        let person_id = match update.author {
            Some(a) => {
                let a = non_blank(&a, "author")?;
                Some(self.store.upsert_person(&a).await.map_err(store_err)?.id)
            }
            None => None,
        };

        let patch = QuotePatch {
            text,
            context: update.context,
            source: update.source,
            person_id,
            updated_at: now(),
        };
        if !self.store.update_quote(id, &patch).await.map_err(store_err)? {
            return Err(EngineError::quote_not_found(id));
        }
        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.store.delete_quote(id).await.map_err(store_err)? {
            debug!(quote_id = %id, "quote deleted");
            Ok(())
        } else {
            Err(EngineError::quote_not_found(id))
        }
    }

    /// Import many quotes, embedding `batch_size` texts per provider call.
    ///
    /// Invalid items and items whose batch fails to embed are reported in
    /// [`ImportReport::failed`]; nothing is written for them.
    pub async fn create_many(&self, items: Vec<NewQuote>, batch_size: usize) -> ImportReport {
        let mut report = ImportReport::default();
        let batch_size = batch_size.max(1);

        let mut valid = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            match (non_blank(&item.text, "text"), non_blank(&item.author, "author")) {
                (Ok(text), Ok(author)) => valid.push((index, text, author, item.context, item.source)),
                (Err(e), _) | (_, Err(e)) => report.failed.push(ImportFailure {
                    index,
                    error: e.to_string(),
                }),
            }
        }

        for batch in valid.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, t, ..)| t.clone()).collect();
            let vectors = match self.embedder.embed_batch(&texts).await {
                Ok(v) if v.len() == texts.len() => v,
                Ok(v) => {
                    let msg = format!("embedder returned {} vectors for {} texts", v.len(), texts.len());
                    warn!("{}", msg);
                    for (index, ..) in batch {
                        report.failed.push(ImportFailure { index: *index, error: msg.clone() });
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "embedding batch failed");
                    for (index, ..) in batch {
                        report.failed.push(ImportFailure {
                            index: *index,
                            error: format!("embedding provider unavailable: {e:#}"),
                        });
                    }
                    continue;
                }
            };

            for ((index, text, author, context, source), embedding) in batch.iter().zip(vectors) {
                match self
                    .persist(text.clone(), author.clone(), context.clone(), source.clone(), embedding)
                    .await
                {
                    Ok((_, CreateOutcome::Created)) => report.created += 1,
                    Ok((_, CreateOutcome::Merged)) => report.merged += 1,
                    Err(e) => report.failed.push(ImportFailure {
                        index: *index,
                        error: e.to_string(),
                    }),
                }
            }
        }

        report.failed.sort_by_key(|f| f.index);
        report
    }
}
