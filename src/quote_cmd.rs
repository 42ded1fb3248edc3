//! Quote CRUD commands: `qm add`, `get`, `list`, `edit`, `remove`, `search`.
//!
//! Each command opens [`Services`], calls the quote service or store, and
//! prints a human-readable result to stdout.

use anyhow::Result;

use quotemap_core::models::{NewQuote, Quote, QuoteFilter, QuoteUpdate};
use quotemap_core::quotes::CreateOutcome;

use crate::config::Config;
use crate::services::Services;
use crate::stats::format_ts_iso;

/// Fields accepted by `qm edit`. Everything is optional.
#[derive(Debug, Default)]
pub struct EditArgs {
    pub text: Option<String>,
    pub author: Option<String>,
    pub context: Option<String>,
    pub source: Option<String>,
}

fn cluster_display(quote: &Quote) -> String {
    match quote.placement() {
        Some((label, x, y)) => format!("cluster {} at ({:.3}, {:.3})", label, x, y),
        None => "not yet placed (run `qm recompute`)".to_string(),
    }
}

fn print_quote(quote: &Quote) {
    println!("\"{}\"", quote.text);
    println!("  — {}", quote.author.name);
    println!("  id:       {}", quote.id);
    if let Some(ctx) = &quote.context {
        println!("  context:  {}", ctx);
    }
    if let Some(src) = &quote.source {
        println!("  source:   {}", src);
    }
    println!("  placed:   {}", cluster_display(quote));
    println!("  updated:  {}", format_ts_iso(quote.updated_at));
}

fn print_row(quote: &Quote) {
    let cluster = match quote.cluster_id {
        Some(c) => c.to_string(),
        None if quote.x.is_some() => "-1".to_string(),
        None => "-".to_string(),
    };
    println!(
        "{}  [{:>5}]  {} — {}",
        quote.id,
        cluster,
        truncate(&quote.text, 60),
        quote.author.name
    );
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

pub async fn run_add(
    config: &Config,
    text: &str,
    author: &str,
    context: Option<String>,
    source: Option<String>,
) -> Result<()> {
    let services = Services::open(config).await?;
    let input = NewQuote {
        text: text.to_string(),
        author: author.to_string(),
        context,
        source,
    };
    let result = services.quotes.create_with_outcome(input).await;
    services.close().await;

    let (quote, outcome) = result?;
    match outcome {
        CreateOutcome::Created => println!("Created quote {}", quote.id),
        CreateOutcome::Merged => println!("Merged into existing quote {}", quote.id),
    }
    Ok(())
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let top_k = services.config.similarity.default_top_k;

    let quote = services.quotes.get(id).await;
    let neighbors = match &quote {
        Ok(_) => services.engine.neighbors(id, top_k).await,
        Err(_) => Ok(Vec::new()),
    };
    let mut similar = Vec::new();
    if let Ok(neighbors) = &neighbors {
        for n in neighbors {
            if let Some(q) = services.store.get_quote(&n.quote_id).await? {
                similar.push((n.similarity, q));
            }
        }
    }
    services.close().await;

    let quote = quote?;
    neighbors?;

    print_quote(&quote);
    if !similar.is_empty() {
        println!();
        println!("  Most similar:");
        for (sim, q) in &similar {
            println!("    {:.3}  {} — {}", sim, truncate(&q.text, 56), q.author.name);
        }
    }
    Ok(())
}

pub async fn run_list(
    config: &Config,
    person: Option<String>,
    cluster_id: Option<u32>,
    limit: Option<usize>,
) -> Result<()> {
    let services = Services::open(config).await?;
    let filter = QuoteFilter {
        person,
        cluster_id,
        limit,
    };
    let quotes = services.store.list_quotes(&filter).await;
    services.close().await;
    let quotes = quotes?;

    if quotes.is_empty() {
        println!("No quotes found.");
        return Ok(());
    }
    for q in &quotes {
        print_row(q);
    }
    println!();
    println!("{} quote{}", quotes.len(), if quotes.len() == 1 { "" } else { "s" });
    Ok(())
}

pub async fn run_search(config: &Config, query: &str, limit: usize) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("search query must not be empty");
    }
    let services = Services::open(config).await?;
    let hits = services.store.search_quotes(query, limit).await;
    services.close().await;
    let hits = hits?;

    if hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    for q in &hits {
        print_row(q);
    }
    Ok(())
}

pub async fn run_edit(config: &Config, id: &str, args: EditArgs) -> Result<()> {
    if args.text.is_none() && args.author.is_none() && args.context.is_none() && args.source.is_none()
    {
        anyhow::bail!("nothing to change: pass at least one of --text, --author, --context, --source");
    }
    let services = Services::open(config).await?;
    let update = QuoteUpdate {
        text: args.text,
        author: args.author,
        context: args.context,
        source: args.source,
    };
    let result = services.quotes.update(id, update).await;
    services.close().await;

    let quote = result?;
    println!("Updated quote {}", quote.id);
    print_quote(&quote);
    Ok(())
}

pub async fn run_remove(config: &Config, id: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let result = services.quotes.delete(id).await;
    services.close().await;

    result?;
    println!("Removed quote {}", id);
    Ok(())
}
