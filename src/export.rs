//! Export the quote graph as JSON.
//!
//! Nodes are quotes (with their cluster and layout position) and people.
//! Edges are `attributed_to` (quote → person) and `similar_to` (quote ↔
//! quote, weighted by similarity). Used by `qm graph` and `GET /graph`.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use quotemap_core::models::QuoteFilter;
use quotemap_core::store::Store;

use crate::config::Config;
use crate::services::Services;

#[derive(Debug, Serialize)]
pub struct GraphExport {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphNode {
    Quote {
        id: String,
        text: String,
        author: String,
        cluster_id: Option<u32>,
        x: Option<f64>,
        y: Option<f64>,
    },
    Person {
        id: String,
        name: String,
    },
}

#[derive(Debug, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    AttributedTo,
    SimilarTo,
}

/// Build the graph from the current records and derived state.
pub async fn build_graph(store: &dyn Store) -> Result<GraphExport> {
    let people = store.list_people().await?;
    let mut quotes = store.list_quotes(&QuoteFilter::default()).await?;
    quotes.sort_by(|a, b| a.id.cmp(&b.id));
    let similar = store.list_similarity_edges().await?;

    let mut nodes = Vec::with_capacity(people.len() + quotes.len());
    let mut edges = Vec::with_capacity(quotes.len() + similar.len());

    for p in people {
        nodes.push(GraphNode::Person {
            id: p.id,
            name: p.name,
        });
    }
    for q in quotes {
        edges.push(GraphEdge {
            source: q.id.clone(),
            target: q.author.id.clone(),
            kind: EdgeKind::AttributedTo,
            weight: None,
        });
        nodes.push(GraphNode::Quote {
            id: q.id,
            text: q.text,
            author: q.author.name,
            cluster_id: q.cluster_id,
            x: q.x,
            y: q.y,
        });
    }
    for e in similar {
        edges.push(GraphEdge {
            source: e.source_id,
            target: e.target_id,
            kind: EdgeKind::SimilarTo,
            weight: Some(e.similarity),
        });
    }

    Ok(GraphExport { nodes, edges })
}

/// Export the graph as JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_graph(config: &Config, output: Option<&Path>) -> Result<()> {
    let services = Services::open(config).await?;
    let graph = build_graph(services.store.as_ref()).await;
    services.close().await;
    let graph = graph?;

    let json = serde_json::to_string_pretty(&graph)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, &json)?;
            eprintln!(
                "Exported {} nodes, {} edges to {}",
                graph.nodes.len(),
                graph.edges.len(),
                path.display()
            );
        }
        None => {
            println!("{}", json);
        }
    }

    Ok(())
}
