//! # Quotemap
//!
//! A local-first quote library that links quotes by meaning.
//!
//! Quotes are embedded on write and stored in SQLite. An explicit recompute
//! turns the full set of embeddings into a similarity graph, density
//! clusters and a 2-D layout, and swaps that derived state in atomically.
//! Everything is reachable from the `qm` CLI and a JSON HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌───────────────┐
//! │ CLI/HTTP │──▶│ QuoteService│──▶│   Embedder    │
//! └────┬─────┘   └──────┬──────┘   │ hash/openai/  │
//!      │                │          │ ollama/local  │
//!      │                ▼          └───────────────┘
//!      │         ┌─────────────┐
//!      └────────▶│   Engine    │──▶ SqliteStore (quotes, edges,
//!   recompute    │ sim/cluster │     clusters, layout)
//!                │ /projection │
//!                └─────────────┘
//! ```
//!
//! The algorithms live in the `quotemap-core` crate; this crate supplies
//! configuration, the SQLite store, embedding providers, the CLI commands
//! and the HTTP server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` trait |
//! | [`embedding`] | Embedding providers |
//! | [`services`] | Wiring shared by CLI and server |
//! | [`quote_cmd`] | Quote CRUD commands |
//! | [`import`] | Bulk JSON import |
//! | [`recompute_cmd`] | Recompute and similarity commands |
//! | [`stats`] | Library statistics |
//! | [`export`] | Graph export |
//! | [`server`] | HTTP API |
//! | [`logging`] | tracing subscriber setup |

pub mod config;
pub mod db;
pub mod embedding;
pub mod export;
pub mod import;
pub mod logging;
pub mod migrate;
pub mod quote_cmd;
pub mod recompute_cmd;
pub mod server;
pub mod services;
pub mod sqlite_store;
pub mod stats;
