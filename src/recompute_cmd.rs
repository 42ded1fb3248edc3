//! Similarity commands: `qm recompute`, `qm similar`, `qm similarity`.

use anyhow::Result;

use crate::config::Config;
use crate::services::{self, Services};

pub async fn run_recompute(config: &Config, threshold: Option<f64>) -> Result<()> {
    let services = Services::open(config).await?;
    let result = services::recompute(&services.engine, threshold).await;
    services.close().await;

    let summary = result?;
    println!("Recompute complete (run {})", summary.run_id);
    println!("  threshold: {}", summary.threshold);
    println!("  quotes processed: {}", summary.quotes_processed);
    println!("  edges created: {}", summary.edges_created);
    println!("  clusters found: {}", summary.clusters_found);
    println!("  noise: {}", summary.noise_count);
    Ok(())
}

pub async fn run_similar(config: &Config, id: &str, top_k: Option<usize>) -> Result<()> {
    let services = Services::open(config).await?;
    let top_k = top_k.unwrap_or(services.config.similarity.default_top_k);

    let neighbors = services.engine.neighbors(id, top_k).await;
    let mut rows = Vec::new();
    if let Ok(neighbors) = &neighbors {
        for n in neighbors {
            if let Some(q) = services.store.get_quote(&n.quote_id).await? {
                rows.push((n.similarity, q));
            }
        }
    }
    services.close().await;
    neighbors?;

    if rows.is_empty() {
        println!("No other quotes.");
        return Ok(());
    }
    for (sim, q) in &rows {
        println!("{:.4}  {}  {} — {}", sim, q.id, q.text, q.author.name);
    }
    Ok(())
}

pub async fn run_similarity(config: &Config, a: &str, b: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let result = services.engine.similarity_between(a, b).await;
    services.close().await;

    println!("{:.6}", result?);
    Ok(())
}
