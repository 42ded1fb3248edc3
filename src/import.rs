//! Bulk import: `qm import <file.json>`.
//!
//! The file holds a JSON array of `{text, author, context?, source?}`
//! objects. Texts are embedded `[embedding].batch_size` at a time; an item
//! that fails validation or embedding is reported and skipped.

use anyhow::{Context, Result};
use std::path::Path;

use quotemap_core::models::NewQuote;
use quotemap_core::quotes::ImportReport;

use crate::config::Config;
use crate::services::Services;

/// Parse an import file into quote inputs.
pub fn read_import_file(path: &Path) -> Result<Vec<NewQuote>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    let items: Vec<NewQuote> = serde_json::from_str(&content).with_context(|| {
        format!(
            "Failed to parse {}: expected a JSON array of {{text, author, context?, source?}}",
            path.display()
        )
    })?;
    Ok(items)
}

pub async fn import_quotes(services: &Services, items: Vec<NewQuote>) -> ImportReport {
    let batch_size = services.config.embedding.batch_size;
    services.quotes.create_many(items, batch_size).await
}

pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let items = read_import_file(path)?;
    let total = items.len();

    let services = Services::open(config).await?;
    let report = import_quotes(&services, items).await;
    services.close().await;

    println!("Import {}", path.display());
    println!("  items:   {}", total);
    println!("  created: {}", report.created);
    println!("  merged:  {}", report.merged);
    println!("  failed:  {}", report.failed.len());
    for f in &report.failed {
        println!("    #{}: {}", f.index, f.error);
    }
    if report.created + report.merged > 0 {
        println!();
        println!("Run `qm recompute` to link and cluster the new quotes.");
    }
    Ok(())
}
