//! # Quotemap CLI (`qm`)
//!
//! The `qm` binary manages a quote library: adding and editing quotes,
//! recomputing the similarity graph, clusters and 2-D layout, and serving
//! everything over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! qm --config ./config/qm.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qm init` | Create the SQLite database and run schema migrations |
//! | `qm add "<text>" --author <name>` | Embed and store a quote |
//! | `qm import <file.json>` | Bulk import quotes |
//! | `qm get <id>` | Show a quote and its most similar quotes |
//! | `qm list` | List quotes, optionally by person or cluster |
//! | `qm search "<text>"` | Substring search |
//! | `qm edit <id>` / `qm remove <id>` | Change or delete a quote |
//! | `qm recompute` | Rebuild edges, clusters and layout |
//! | `qm similar <id>` / `qm similarity <a> <b>` | Similarity queries |
//! | `qm stats` / `qm graph` | Read models |
//! | `qm serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! qm init
//! qm add "The only true wisdom is in knowing you know nothing." --author Socrates
//! qm import ./quotes.json
//! qm recompute --threshold 0.8
//! qm graph --output ./public/graph.json
//! qm serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use quotemap::{
    config, export, import, logging, migrate, quote_cmd, recompute_cmd, server, stats,
};

/// Quotemap CLI: link, cluster and map quotes by meaning.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Only `[db].path` is required.
#[derive(Parser)]
#[command(
    name = "qm",
    about = "Quotemap — link, cluster and map quotes by embedding similarity",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qm.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). Ignored when `RUST_LOG` is set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Add a quote. Text identical to an existing quote merges into it.
    Add {
        /// Quote text.
        text: String,

        /// Author display name. Created on first use.
        #[arg(long)]
        author: String,

        #[arg(long)]
        context: Option<String>,

        #[arg(long)]
        source: Option<String>,
    },

    /// Import a JSON array of `{text, author, context?, source?}` objects.
    Import {
        file: PathBuf,
    },

    /// Show a quote with its most similar quotes.
    Get {
        id: String,
    },

    /// List quotes, newest first.
    List {
        /// Only quotes by this author.
        #[arg(long)]
        person: Option<String>,

        /// Only quotes in this cluster (from the last recompute).
        #[arg(long)]
        cluster: Option<u32>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Case-insensitive substring search over text, context and author.
    Search {
        query: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Edit a quote. Changing the text re-embeds it.
    Edit {
        id: String,

        #[arg(long)]
        text: Option<String>,

        #[arg(long)]
        author: Option<String>,

        #[arg(long)]
        context: Option<String>,

        #[arg(long)]
        source: Option<String>,
    },

    /// Delete a quote with its similarity edges and placement.
    Remove {
        id: String,
    },

    /// Rebuild similarity edges, clusters and the 2-D layout.
    Recompute {
        /// Edge threshold in [0, 1]. Defaults to `[similarity].threshold`.
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// The most similar quotes to a quote.
    Similar {
        id: String,

        /// Defaults to `[similarity].default_top_k`.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Cosine similarity of two quotes.
    Similarity {
        a: String,
        b: String,
    },

    /// Show library statistics.
    Stats,

    /// Export the quote graph as JSON.
    Graph {
        /// Output file path. Omit to write to stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Add {
            text,
            author,
            context,
            source,
        } => {
            quote_cmd::run_add(&cfg, &text, &author, context, source).await?;
        }
        Commands::Import { file } => {
            import::run_import(&cfg, &file).await?;
        }
        Commands::Get { id } => {
            quote_cmd::run_get(&cfg, &id).await?;
        }
        Commands::List {
            person,
            cluster,
            limit,
        } => {
            quote_cmd::run_list(&cfg, person, cluster, limit).await?;
        }
        Commands::Search { query, limit } => {
            quote_cmd::run_search(&cfg, &query, limit).await?;
        }
        Commands::Edit {
            id,
            text,
            author,
            context,
            source,
        } => {
            let args = quote_cmd::EditArgs {
                text,
                author,
                context,
                source,
            };
            quote_cmd::run_edit(&cfg, &id, args).await?;
        }
        Commands::Remove { id } => {
            quote_cmd::run_remove(&cfg, &id).await?;
        }
        Commands::Recompute { threshold } => {
            recompute_cmd::run_recompute(&cfg, threshold).await?;
        }
        Commands::Similar { id, top_k } => {
            recompute_cmd::run_similar(&cfg, &id, top_k).await?;
        }
        Commands::Similarity { a, b } => {
            recompute_cmd::run_similarity(&cfg, &a, &b).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Graph { output } => {
            export::run_graph(&cfg, output.as_deref()).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
