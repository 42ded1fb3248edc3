//! Library statistics: `qm stats` and `GET /analytics/stats`.
//!
//! Counts come from [`Store::stats`](quotemap_core::store::Store::stats);
//! this module only formats them.

use anyhow::Result;

use quotemap_core::store::StoreStats;

use crate::config::Config;
use crate::services::Services;

/// Number of people listed in the "top people" table.
pub const TOP_PEOPLE: usize = 10;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let services = Services::open(config).await?;
    let stats = services.store.stats(TOP_PEOPLE).await;
    services.close().await;
    let stats = stats?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Quotemap — Library Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    print_stats(&stats);
    Ok(())
}

fn print_stats(stats: &StoreStats) {
    println!("  Quotes:      {}", stats.total_quotes);
    println!("  People:      {}", stats.total_people);
    println!("  Per person:  {:.2}", stats.avg_quotes_per_person);
    println!("  Edges:       {}", stats.similarity_edges);

    match &stats.last_run {
        Some(run) => {
            println!(
                "  Last run:    {} (threshold {}, {} clusters, {} noise)",
                format_ts_relative(run.computed_at),
                run.threshold,
                run.clusters_found,
                stats.noise_count
            );
        }
        None => println!("  Last run:    never"),
    }

    if !stats.top_people.is_empty() {
        println!();
        println!("  Top people:");
        println!("  {:<32} {:>6}", "NAME", "QUOTES");
        println!("  {}", "-".repeat(39));
        for p in &stats.top_people {
            println!("  {:<32} {:>6}", p.name, p.quote_count);
        }
    }

    if !stats.cluster_distribution.is_empty() {
        println!();
        println!("  Clusters:");
        println!("  {:<8} {:>6} {:>14}", "CLUSTER", "QUOTES", "AVG SIMILARITY");
        println!("  {}", "-".repeat(30));
        for c in &stats.cluster_distribution {
            println!(
                "  {:<8} {:>6} {:>14.3}",
                c.cluster_id, c.quote_count, c.avg_similarity
            );
        }
    }

    println!();
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
