//! TOML configuration.
//!
//! Every section is optional and falls back to the defaults below, so an
//! empty file (or no file at all) yields a working local setup: Chroma on
//! `localhost:8000` and Ollama on `localhost:11434`.
//!
//! A handful of environment variables override the file after loading:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `CHROMA_ENDPOINT` | `store.url` |
//! | `OLLAMA_MODEL_NAME` | `chat.model` |
//! | `EMBEDDING_SPLITTER_CHUNK_SIZE` | `chunking.chunk_size` |
//! | `PORT` | port part of `server.bind` |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory that relative PDF paths in `POST /upsert` resolve against.
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            document_root: default_document_root(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_document_root() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `"chroma"` or `"memory"`.
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: default_store_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_store_backend() -> String {
    "chroma".to_string()
}
fn default_store_url() -> String {
    "http://localhost:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"ollama"` or `"openai"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Base URL for Ollama. Ignored by the OpenAI provider.
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
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}
fn default_embedding_model() -> String {
    "llama3.2".to_string()
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
pub struct ChatConfig {
    /// `"ollama"` or `"openai"`.
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_chat_provider(),
            model: default_chat_model(),
            url: None,
            timeout_secs: default_chat_timeout_secs(),
        }
    }
}

fn default_chat_provider() -> String {
    "ollama".to_string()
}
fn default_chat_model() -> String {
    "llama3.2".to_string()
}
fn default_chat_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    8192
}
fn default_chunk_overlap() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// Cap on in-flight embedding/search calls per collection.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Source tag used by `POST /upsert` and `POST /qna`.
    #[serde(default = "default_source")]
    pub default_source: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_concurrency: default_max_concurrency(),
            default_source: default_source(),
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_max_concurrency() -> usize {
    4
}
fn default_source() -> String {
    "DBT Handbook".to_string()
}

/// Load the configuration file, apply environment overrides and validate.
///
/// A missing file is not an error; defaults are used instead.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

impl Config {
    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("CHROMA_ENDPOINT").filter(|v| !v.is_empty()) {
            self.store.url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL_NAME").filter(|v| !v.is_empty()) {
            self.chat.model = model;
        }
        if let Some(size) = lookup("EMBEDDING_SPLITTER_CHUNK_SIZE").filter(|v| !v.is_empty()) {
            self.chunking.chunk_size = size
                .parse()
                .with_context(|| format!("EMBEDDING_SPLITTER_CHUNK_SIZE is not a number: {}", size))?;
        }
        if let Some(port) = lookup("PORT").filter(|v| !v.is_empty()) {
            let port: u16 = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {}", port))?;
            let host = self
                .server
                .bind
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind = format!("{}:{}", host, port);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }
        if self.retrieval.max_concurrency == 0 {
            bail!("retrieval.max_concurrency must be >= 1");
        }
        if self.retrieval.default_k == 0 {
            bail!("retrieval.default_k must be >= 1");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }

        match self.store.backend.as_str() {
            "chroma" | "memory" => {}
            other => bail!(
                "Unknown store backend: '{}'. Must be chroma or memory.",
                other
            ),
        }
        match self.embedding.provider.as_str() {
            "ollama" | "openai" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be ollama or openai.",
                other
            ),
        }
        match self.chat.provider.as_str() {
            "ollama" | "openai" => {}
            other => bail!(
                "Unknown chat provider: '{}'. Must be ollama or openai.",
                other
            ),
        }

        Ok(())
    }
}
