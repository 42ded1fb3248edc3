//! SQLite-backed [`Store`] implementation.
//!
//! Quotes, people and the derived state of the last recompute live in the
//! tables created by [`migrate`](crate::migrate). Derived rows are replaced
//! wholesale inside one transaction, so readers see either the previous
//! snapshot or the new one.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use quotemap_core::embedding::{blob_to_vec, vec_to_blob};
use quotemap_core::models::{
    ClusterLabel, DerivedSnapshot, Person, Quote, QuoteDerived, QuoteFilter, QuoteId, RunInfo,
    SimilarityEdge,
};
use quotemap_core::store::{assemble_stats, QuotePatch, QuoteRecord, Store, StoreStats};

/// Seconds after which an unreleased recompute lease is considered stale.
pub const LEASE_TTL_SECS: i64 = 3600;

/// Number of `derived_runs` rows kept; older runs are pruned on write.
pub const RUN_HISTORY_LIMIT: i64 = 50;

const QUOTE_SELECT: &str = r#"
    SELECT q.id, q.text, q.context, q.source, q.created_at, q.updated_at,
           p.id AS person_id, p.name AS person_name, p.bio AS person_bio,
           p.image_url AS person_image_url, p.created_at AS person_created_at,
           d.cluster_id, d.x, d.y
    FROM quotes q
    JOIN people p ON p.id = q.person_id
    LEFT JOIN quote_derived d ON d.quote_id = q.id
"#;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn person_from_row(row: &SqliteRow) -> Person {
    Person {
        id: row.get("id"),
        name: row.get("name"),
        bio: row.get("bio"),
        image_url: row.get("image_url"),
        created_at: row.get("created_at"),
    }
}

fn quote_from_row(row: &SqliteRow) -> Quote {
    let cluster_id: Option<i64> = row.get("cluster_id");
    Quote {
        id: row.get("id"),
        text: row.get("text"),
        context: row.get("context"),
        source: row.get("source"),
        author: Person {
            id: row.get("person_id"),
            name: row.get("person_name"),
            bio: row.get("person_bio"),
            image_url: row.get("person_image_url"),
            created_at: row.get("person_created_at"),
        },
        cluster_id: cluster_id.map(|c| c as u32),
        x: row.get("x"),
        y: row.get("y"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn run_from_row(row: &SqliteRow) -> RunInfo {
    let clusters_found: i64 = row.get("clusters_found");
    let edges_created: i64 = row.get("edges_created");
    let quotes_processed: i64 = row.get("quotes_processed");
    let noise_count: i64 = row.get("noise_count");
    RunInfo {
        run_id: row.get("run_id"),
        computed_at: row.get("computed_at"),
        threshold: row.get("threshold"),
        clusters_found: clusters_found as usize,
        edges_created: edges_created as usize,
        quotes_processed: quotes_processed as usize,
        noise_count: noise_count as usize,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_person(&self, name: &str) -> Result<Person> {
        sqlx::query(
            "INSERT INTO people (id, name, created_at) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(now())
        .execute(&self.pool)
        .await?;

        self.get_person_by_name(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("person '{}' vanished after upsert", name))
    }

    async fn create_person(
        &self,
        name: &str,
        bio: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<Option<Person>> {
        let result = sqlx::query(
            r#"
            INSERT INTO people (id, name, bio, image_url, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(bio)
        .bind(image_url)
        .bind(now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_person_by_name(name).await
    }

    async fn get_person_by_name(&self, name: &str) -> Result<Option<Person>> {
        let row = sqlx::query("SELECT id, name, bio, image_url, created_at FROM people WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(person_from_row))
    }

    async fn list_people(&self) -> Result<Vec<Person>> {
        let rows =
            sqlx::query("SELECT id, name, bio, image_url, created_at FROM people ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(person_from_row).collect())
    }

    async fn insert_quote(&self, record: &QuoteRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quotes (id, text, context, source, person_id, embedding, dims,
                                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.text)
        .bind(&record.context)
        .bind(&record.source)
        .bind(&record.person_id)
        .bind(vec_to_blob(&record.embedding))
        .bind(record.embedding.len() as i64)
        .bind(record.created_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_quote(&self, id: &str, patch: &QuotePatch) -> Result<bool> {
        let text = patch.text.as_ref().map(|r| r.text.as_str());
        let blob = patch.text.as_ref().map(|r| vec_to_blob(&r.embedding));
        let dims = patch.text.as_ref().map(|r| r.embedding.len() as i64);

        let result = sqlx::query(
            r#"
            UPDATE quotes SET
                text = COALESCE(?, text),
                embedding = COALESCE(?, embedding),
                dims = COALESCE(?, dims),
                context = COALESCE(?, context),
                source = COALESCE(?, source),
                person_id = COALESCE(?, person_id),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(text)
        .bind(blob)
        .bind(dims)
        .bind(&patch.context)
        .bind(&patch.source)
        .bind(&patch.person_id)
        .bind(patch.updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_quote(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM similarity_edges WHERE source_id = ? OR target_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM quote_derived WHERE quote_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM quotes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_quote(&self, id: &str) -> Result<Option<Quote>> {
        let row = sqlx::query(&format!("{} WHERE q.id = ?", QUOTE_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(quote_from_row))
    }

    async fn find_quote_by_text(&self, text: &str) -> Result<Option<Quote>> {
        let row = sqlx::query(&format!("{} WHERE q.text = ?", QUOTE_SELECT))
            .bind(text)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(quote_from_row))
    }

    async fn list_quotes(&self, filter: &QuoteFilter) -> Result<Vec<Quote>> {
        let sql = format!(
            r#"{}
            WHERE (? IS NULL OR p.name = ?)
              AND (? IS NULL OR d.cluster_id = ?)
            ORDER BY q.created_at DESC, q.id ASC
            LIMIT ?"#,
            QUOTE_SELECT
        );
        let cluster = filter.cluster_id.map(|c| c as i64);
        // LIMIT -1 means no limit in SQLite
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let rows = sqlx::query(&sql)
            .bind(&filter.person)
            .bind(&filter.person)
            .bind(cluster)
            .bind(cluster)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(quote_from_row).collect())
    }

    async fn search_quotes(&self, query: &str, limit: usize) -> Result<Vec<Quote>> {
        let sql = format!(
            r#"{}
            WHERE instr(lower(q.text), lower(?)) > 0
               OR instr(lower(COALESCE(q.context, '')), lower(?)) > 0
               OR instr(lower(p.name), lower(?)) > 0
            ORDER BY q.created_at DESC, q.id ASC
            LIMIT ?"#,
            QUOTE_SELECT
        );
        let rows = sqlx::query(&sql)
            .bind(query)
            .bind(query)
            .bind(query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(quote_from_row).collect())
    }

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query("SELECT embedding FROM quotes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let blob: Vec<u8> = r.get("embedding");
            blob_to_vec(&blob)
        }))
    }

    async fn embedding_dims(&self) -> Result<Option<usize>> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM quotes LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(dims.map(|d| d as usize))
    }

    async fn list_quote_embeddings(&self) -> Result<Vec<(QuoteId, Vec<f32>)>> {
        let rows = sqlx::query("SELECT id, embedding FROM quotes ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get("id"), blob_to_vec(&blob))
            })
            .collect())
    }

    async fn replace_derived_state(&self, snapshot: &DerivedSnapshot) -> Result<RunInfo> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM similarity_edges")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM quote_derived")
            .execute(&mut *tx)
            .await?;

        // Quotes deleted while the recompute ran are skipped
        let mut quotes_processed = 0u64;
        let mut noise_count = 0u64;
        for row in &snapshot.quotes {
            let result = sqlx::query(
                r#"
                INSERT INTO quote_derived (quote_id, cluster_id, x, y, run_id)
                SELECT ?, ?, ?, ?, ?
                WHERE EXISTS (SELECT 1 FROM quotes WHERE id = ?)
                "#,
            )
            .bind(&row.quote_id)
            .bind(row.cluster_id.id().map(i64::from))
            .bind(row.x)
            .bind(row.y)
            .bind(&snapshot.run_id)
            .bind(&row.quote_id)
            .execute(&mut *tx)
            .await?;
            quotes_processed += result.rows_affected();
            if row.cluster_id.is_noise() {
                noise_count += result.rows_affected();
            }
        }

        let mut edges_created = 0u64;
        for edge in &snapshot.edges {
            let result = sqlx::query(
                r#"
                INSERT INTO similarity_edges (source_id, target_id, similarity, run_id)
                SELECT ?, ?, ?, ?
                WHERE EXISTS (SELECT 1 FROM quotes WHERE id = ?)
                  AND EXISTS (SELECT 1 FROM quotes WHERE id = ?)
                "#,
            )
            .bind(&edge.source_id)
            .bind(&edge.target_id)
            .bind(edge.similarity)
            .bind(&snapshot.run_id)
            .bind(&edge.source_id)
            .bind(&edge.target_id)
            .execute(&mut *tx)
            .await?;
            edges_created += result.rows_affected();
        }

        sqlx::query(
            r#"
            INSERT INTO derived_runs (run_id, computed_at, threshold, clusters_found,
                                      edges_created, quotes_processed, noise_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                computed_at = excluded.computed_at,
                threshold = excluded.threshold,
                clusters_found = excluded.clusters_found,
                edges_created = excluded.edges_created,
                quotes_processed = excluded.quotes_processed,
                noise_count = excluded.noise_count
            "#,
        )
        .bind(&snapshot.run_id)
        .bind(snapshot.computed_at)
        .bind(snapshot.threshold)
        .bind(snapshot.clusters_found as i64)
        .bind(edges_created as i64)
        .bind(quotes_processed as i64)
        .bind(noise_count as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM derived_runs
            WHERE rowid NOT IN (
                SELECT rowid FROM derived_runs
                ORDER BY computed_at DESC, rowid DESC
                LIMIT ?
            )
            "#,
        )
        .bind(RUN_HISTORY_LIMIT)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RunInfo {
            run_id: snapshot.run_id.clone(),
            computed_at: snapshot.computed_at,
            threshold: snapshot.threshold,
            clusters_found: snapshot.clusters_found,
            edges_created: edges_created as usize,
            quotes_processed: quotes_processed as usize,
            noise_count: noise_count as usize,
        })
    }

    async fn derived_state(&self) -> Result<Vec<QuoteDerived>> {
        let rows =
            sqlx::query("SELECT quote_id, cluster_id, x, y FROM quote_derived ORDER BY quote_id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let cluster_id: Option<i64> = row.get("cluster_id");
                QuoteDerived {
                    quote_id: row.get("quote_id"),
                    cluster_id: ClusterLabel::from(cluster_id.map(|c| c as u32)),
                    x: row.get("x"),
                    y: row.get("y"),
                }
            })
            .collect())
    }

    async fn list_similarity_edges(&self) -> Result<Vec<SimilarityEdge>> {
        let rows = sqlx::query(
            "SELECT source_id, target_id, similarity FROM similarity_edges ORDER BY source_id ASC, target_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| SimilarityEdge {
                source_id: row.get("source_id"),
                target_id: row.get("target_id"),
                similarity: row.get("similarity"),
            })
            .collect())
    }

    async fn latest_run(&self) -> Result<Option<RunInfo>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, computed_at, threshold, clusters_found, edges_created,
                   quotes_processed, noise_count
            FROM derived_runs
            ORDER BY computed_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(run_from_row))
    }

    async fn stats(&self, top_n: usize) -> Result<StoreStats> {
        let total_quotes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quotes")
            .fetch_one(&self.pool)
            .await?;
        let total_people: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM people")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT p.name AS name, COUNT(q.id) AS quote_count
            FROM people p
            JOIN quotes q ON q.person_id = p.id
            GROUP BY p.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let counts = rows
            .iter()
            .map(|row| {
                let n: i64 = row.get("quote_count");
                (row.get::<String, _>("name"), n as usize)
            })
            .collect();

        let derived = self.derived_state().await?;
        let edges = self.list_similarity_edges().await?;
        let last_run = self.latest_run().await?;

        Ok(assemble_stats(
            total_quotes as usize,
            total_people as usize,
            counts,
            &derived,
            &edges,
            last_run,
            top_n,
        ))
    }

    async fn try_acquire_recompute_lease(&self, holder: &str) -> Result<bool> {
        let now = now();
        let result = sqlx::query(
            r#"
            INSERT INTO recompute_lease (id, holder, acquired_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at
            WHERE recompute_lease.acquired_at < ?
            "#,
        )
        .bind(holder)
        .bind(now)
        .bind(now - LEASE_TTL_SECS)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_recompute_lease(&self, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM recompute_lease WHERE id = 1 AND holder = ?")
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
