use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Vector index storage and build settings.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Directory holding one serialized index artifact per document.
    pub root: PathBuf,
    /// Below this vector count a document gets an exact (flat) index.
    #[serde(default = "default_flat_threshold")]
    pub flat_threshold: usize,
}

fn default_flat_threshold() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window size in characters.
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    /// Overlap with the previous window, in characters. Must be < size.
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Maximum accepted chunks, at most one per source document.
    #[serde(default = "default_diversity_cap")]
    pub diversity_cap: usize,
    /// Nearest-neighbour breadth requested from the merged search space.
    #[serde(default = "default_search_k")]
    pub search_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            diversity_cap: default_diversity_cap(),
            search_k: default_search_k(),
        }
    }
}

fn default_diversity_cap() -> usize {
    3
}
fn default_search_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// One of "ollama" or "openai".
    pub provider: String,
    pub model: String,
    /// Vector dimensionality the provider produces (e.g. 384).
    pub dims: usize,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// One of "ollama" or "openai".
    pub provider: String,
    pub model: String,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_generation_timeout_secs() -> u64 {
    120
}

/// Ingestion task-runner settings.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Fixed delay before a failed ingestion is retried.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Retry attempt cap. Absent means retry without bound.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Worker tasks draining the ingestion queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            retry_backoff_secs: default_retry_backoff_secs(),
            max_attempts: None,
            workers: default_workers(),
        }
    }
}

fn default_retry_backoff_secs() -> u64 {
    60
}
fn default_workers() -> usize {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.size == 0 {
        anyhow::bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        anyhow::bail!("chunking.overlap must be < chunking.size");
    }

    if config.retrieval.diversity_cap < 1 {
        anyhow::bail!("retrieval.diversity_cap must be >= 1");
    }
    if config.retrieval.search_k < 1 {
        anyhow::bail!("retrieval.search_k must be >= 1");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be ollama or openai.",
            other
        ),
    }
    match config.generation.provider.as_str() {
        "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be ollama or openai.",
            other
        ),
    }

    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be >= 1");
    }

    Ok(())
}
