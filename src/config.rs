//! TOML configuration with environment overrides.
//!
//! Every section is optional and falls back to the defaults the pipeline was
//! designed around (500/100 chunking, 60 s TTL, `DocumentChunk` collection).
//! Endpoint URLs may come from the file or from `RABBITMQ_URL` /
//! `WEAVIATE_URL`; the environment wins. Credentials (`OPENAI_API_KEY`) are
//! only ever read from the environment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::DEFAULT_SEPARATORS;
use crate::error::PipelineError;
use crate::topology::TopologyConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_document_queue")]
    pub document_queue: String,
    #[serde(default = "default_user_message_queue")]
    pub user_message_queue: String,
    #[serde(default = "default_dead_letter_exchange")]
    pub dead_letter_exchange: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
    #[serde(default = "default_message_ttl_ms")]
    pub message_ttl_ms: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            document_queue: default_document_queue(),
            user_message_queue: default_user_message_queue(),
            dead_letter_exchange: default_dead_letter_exchange(),
            dead_letter_queue: default_dead_letter_queue(),
            message_ttl_ms: default_message_ttl_ms(),
        }
    }
}

fn default_document_queue() -> String {
    "rag_queue".to_string()
}
fn default_user_message_queue() -> String {
    "user_message_queue".to_string()
}
fn default_dead_letter_exchange() -> String {
    "dlx".to_string()
}
fn default_dead_letter_queue() -> String {
    "dlq".to_string()
}
fn default_message_ttl_ms() -> u32 {
    60_000
}

impl BrokerConfig {
    pub fn topology(&self) -> TopologyConfig {
        TopologyConfig {
            ingest_queues: vec![
                self.document_queue.clone(),
                self.user_message_queue.clone(),
            ],
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
            message_ttl_ms: self.message_ttl_ms,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `weaviate`, `sqlite`, or `memory`.
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_document_class")]
    pub document_class: String,
    #[serde(default = "default_query_class")]
    pub query_class: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: None,
            path: default_store_path(),
            document_class: default_document_class(),
            query_class: default_query_class(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_store_backend() -> String {
    "weaviate".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/ragline.sqlite")
}
fn default_document_class() -> String {
    "DocumentChunk".to_string()
}
fn default_query_class() -> String {
    "QueryVector".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
            separators: default_separators(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    100
}
fn default_separators() -> Vec<String> {
    DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
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

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Also persist embedded queries into the query collection.
    #[serde(default)]
    pub record_queries: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            record_queries: false,
        }
    }
}

fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    /// `openai` or `disabled`.
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: default_completion_model(),
            url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_completion_timeout(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_completion_provider() -> String {
    "openai".to_string()
}
fn default_completion_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_completion_timeout() -> u64 {
    60
}
fn default_max_context_chars() -> usize {
    12_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_connect_attempts() -> u32 {
    3
}
fn default_connect_backoff_ms() -> u64 {
    1_000
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

impl Config {
    /// Apply endpoint overrides from a variable lookup (normally the process
    /// environment).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("RABBITMQ_URL").filter(|v| !v.is_empty()) {
            self.broker.url = Some(url);
        }
        if let Some(url) = lookup("WEAVIATE_URL").filter(|v| !v.is_empty()) {
            self.store.url = Some(url);
        }
    }

    /// The broker URL, which must be present before topology bootstrap.
    pub fn require_broker(&self) -> Result<&str, PipelineError> {
        self.broker.url.as_deref().ok_or_else(|| {
            PipelineError::Config(
                "broker URL not configured (set [broker].url or RABBITMQ_URL)".to_string(),
            )
        })
    }

    /// Embeddings must be enabled before anything is ingested or queried.
    pub fn require_embeddings(&self) -> Result<(), PipelineError> {
        if !self.embedding.is_enabled() {
            return Err(PipelineError::Config(
                "an embedding provider is required; set [embedding].provider".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse and validate configuration text without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Read, parse, validate, and apply environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.apply_env_with(|key| std::env::var(key).ok());
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.size == 0 {
        anyhow::bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.size");
    }

    // Broker
    if config.broker.message_ttl_ms == 0 || config.broker.message_ttl_ms > i32::MAX as u32 {
        anyhow::bail!("broker.message_ttl_ms must be between 1 and {}", i32::MAX);
    }

    // Retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Store
    match config.store.backend.as_str() {
        "weaviate" | "sqlite" | "memory" => {}
        other => anyhow::bail!(
            "Unknown store backend: '{}'. Must be weaviate, sqlite, or memory.",
            other
        ),
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Completion
    match config.completion.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.completion.temperature) {
        anyhow::bail!("completion.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}
