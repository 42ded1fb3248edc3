use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // People, referenced by display name from quotes
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS people (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            bio TEXT,
            image_url TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Quotes with their embedding as a little-endian f32 blob
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quotes (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL UNIQUE,
            context TEXT,
            source TEXT,
            person_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (person_id) REFERENCES people(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Derived placement from the last recompute; NULL cluster_id is noise
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quote_derived (
            quote_id TEXT PRIMARY KEY,
            cluster_id INTEGER,
            x REAL NOT NULL,
            y REAL NOT NULL,
            run_id TEXT NOT NULL,
            FOREIGN KEY (quote_id) REFERENCES quotes(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS similarity_edges (
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            similarity REAL NOT NULL,
            run_id TEXT NOT NULL,
            PRIMARY KEY (source_id, target_id),
            CHECK (source_id < target_id),
            FOREIGN KEY (source_id) REFERENCES quotes(id) ON DELETE CASCADE,
            FOREIGN KEY (target_id) REFERENCES quotes(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS derived_runs (
            run_id TEXT PRIMARY KEY,
            computed_at INTEGER NOT NULL,
            threshold REAL NOT NULL,
            clusters_found INTEGER NOT NULL,
            edges_created INTEGER NOT NULL,
            quotes_processed INTEGER NOT NULL,
            noise_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-row lease shared by every process using this database
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recompute_lease (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_quotes_person_id ON quotes(person_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_quotes_created_at ON quotes(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_quote_derived_cluster ON quote_derived(cluster_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_similarity_edges_target ON similarity_edges(target_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
