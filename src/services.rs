//! Wiring of config, database, embedder, quote service and engine.
//!
//! Both the CLI commands and the HTTP server open one [`Services`] and
//! work through it.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use quotemap_core::engine::Engine;
use quotemap_core::models::RecomputeSummary;
use quotemap_core::quotes::QuoteService;
use quotemap_core::store::Store;
use quotemap_core::EngineError;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

pub struct Services {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub store: Arc<dyn Store>,
    pub quotes: QuoteService,
    pub engine: Arc<Engine>,
}

impl Services {
    /// Connect to the database (migrating it if needed) and build the
    /// embedder and engine from `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config)
            .await
            .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
        migrate::apply(&pool).await?;

        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
        let embedder = create_embedder(&config.embedding)?;
        let engine = Engine::new(store.clone(), config.engine_config())
            .context("Invalid engine configuration")?;

        Ok(Self {
            config: Arc::new(config.clone()),
            pool,
            quotes: QuoteService::new(store.clone(), embedder),
            store,
            engine: Arc::new(engine),
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Run a recompute with the similarity, clustering and projection stages on
/// tokio's blocking pool, keeping runtime workers free for other requests.
pub async fn recompute(
    engine: &Engine,
    threshold: Option<f64>,
) -> std::result::Result<RecomputeSummary, EngineError> {
    engine
        .recompute_with(threshold, |job| async move {
            tokio::task::spawn_blocking(move || job.run())
                .await
                .map_err(|e| EngineError::Store(anyhow::anyhow!("recompute task failed: {}", e)))?
        })
        .await
}
