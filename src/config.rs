//! TOML configuration.
//!
//! Only `[db]` is required. Every other section falls back to defaults so a
//! minimal config is two lines long.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use quotemap_core::cluster::HdbscanParams;
use quotemap_core::engine::EngineConfig;
use quotemap_core::projection::ProjectionParams;
use quotemap_core::similarity::{DEFAULT_THRESHOLD, DEFAULT_TOP_K};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub projection: ProjectionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimilarityConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            default_top_k: default_top_k(),
        }
    }
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}
fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: default_min_cluster_size(),
            min_samples: default_min_samples(),
        }
    }
}

fn default_min_cluster_size() -> usize {
    HdbscanParams::default().min_cluster_size
}
fn default_min_samples() -> usize {
    HdbscanParams::default().min_samples
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectionConfig {
    #[serde(default = "default_n_neighbors")]
    pub n_neighbors: usize,
    #[serde(default = "default_min_dist")]
    pub min_dist: f64,
    #[serde(default = "default_spread")]
    pub spread: f64,
    #[serde(default = "default_n_epochs")]
    pub n_epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            n_neighbors: default_n_neighbors(),
            min_dist: default_min_dist(),
            spread: default_spread(),
            n_epochs: default_n_epochs(),
            seed: default_seed(),
        }
    }
}

fn default_n_neighbors() -> usize {
    15
}
fn default_min_dist() -> f64 {
    0.1
}
fn default_spread() -> f64 {
    1.0
}
fn default_n_epochs() -> usize {
    200
}
fn default_seed() -> u64 {
    42
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

impl Config {
    /// Engine parameters derived from the `[similarity]`, `[clustering]`
    /// and `[projection]` sections.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            threshold: self.similarity.threshold,
            clustering: HdbscanParams {
                min_cluster_size: self.clustering.min_cluster_size,
                min_samples: self.clustering.min_samples,
            },
            projection: ProjectionParams {
                n_neighbors: self.projection.n_neighbors,
                min_dist: self.projection.min_dist,
                spread: self.projection.spread,
                n_epochs: self.projection.n_epochs,
                seed: self.projection.seed,
                ..ProjectionParams::default()
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Similarity
    let t = config.similarity.threshold;
    if t.is_nan() || !(0.0..=1.0).contains(&t) {
        anyhow::bail!("similarity.threshold must be in [0.0, 1.0]");
    }
    if config.similarity.default_top_k == 0 {
        anyhow::bail!("similarity.default_top_k must be >= 1");
    }

    // Clustering
    if config.clustering.min_cluster_size < 2 {
        anyhow::bail!("clustering.min_cluster_size must be >= 2");
    }
    if config.clustering.min_samples == 0
        || config.clustering.min_samples > config.clustering.min_cluster_size
    {
        anyhow::bail!("clustering.min_samples must be between 1 and clustering.min_cluster_size");
    }

    // Projection
    if config.projection.n_neighbors < 2 {
        anyhow::bail!("projection.n_neighbors must be >= 2");
    }
    if !(config.projection.min_dist >= 0.0) {
        anyhow::bail!("projection.min_dist must be >= 0");
    }
    if !(config.projection.spread > 0.0) {
        anyhow::bail!("projection.spread must be > 0");
    }
    if config.projection.min_dist > config.projection.spread {
        anyhow::bail!("projection.min_dist must not exceed projection.spread");
    }
    if config.projection.n_epochs == 0 {
        anyhow::bail!("projection.n_epochs must be >= 1");
    }

    // Embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }

    Ok(())
}
