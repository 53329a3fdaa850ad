use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins. Empty means any origin.
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
    "127.0.0.1:5009".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            collection: default_collection(),
            allowed_extensions: default_allowed_extensions(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl StorageConfig {
    /// Case-insensitive extension check on an uploaded file name.
    pub fn is_allowed(&self, file_name: &str) -> bool {
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_collection() -> String {
    "documents".to_string()
}
fn default_allowed_extensions() -> Vec<String> {
    vec!["pdf".to_string(), "txt".to_string(), "md".to_string()]
}
fn default_max_file_size() -> usize {
    16 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_index_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
        }
    }
}

fn default_index_batch_size() -> usize {
    3
}
fn default_batch_pause_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_top_k")]
    pub similarity_top_k: usize,
    #[serde(default = "default_top_k")]
    pub sparse_top_k: usize,
    #[serde(default = "default_num_queries")]
    pub num_queries: usize,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            similarity_top_k: default_top_k(),
            sparse_top_k: default_top_k(),
            num_queries: default_num_queries(),
            max_sources: default_max_sources(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.5
}
fn default_top_k() -> usize {
    5
}
fn default_num_queries() -> usize {
    4
}
fn default_max_sources() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible endpoint or Ollama host).
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
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashed".to_string()
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
    /// Name of the backend used when a request does not pick one.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_role_description")]
    pub role_description: String,
    #[serde(default = "default_chunk_words")]
    pub chunk_words: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default)]
    pub backends: BTreeMap<String, ChatBackendConfig>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: None,
            role_description: default_role_description(),
            chunk_words: default_chunk_words(),
            chunk_delay_ms: default_chunk_delay_ms(),
            backends: BTreeMap::new(),
        }
    }
}

fn default_role_description() -> String {
    "You are a helpful assistant that answers questions about the uploaded documents. \
     Answer concisely and say so when the documents do not contain the answer."
        .to_string()
}
fn default_chunk_words() -> usize {
    5
}
fn default_chunk_delay_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatBackendConfig {
    pub kind: ChatBackendKind,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Azure only.
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatBackendKind {
    Openai,
    Azure,
    Gemini,
    OllamaClient,
    OllamaBatch,
}

impl Config {
    /// A runnable configuration with in-process embeddings and no chat
    /// backends.
    pub fn minimal() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            chunking: ChunkingConfig::default(),
            indexing: IndexingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            chat: ChatConfig::default(),
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

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.indexing.batch_size == 0 {
        anyhow::bail!("indexing.batch_size must be >= 1");
    }

    // Validate retrieval
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.similarity_top_k == 0 || config.retrieval.sparse_top_k == 0 {
        anyhow::bail!("retrieval.similarity_top_k and retrieval.sparse_top_k must be >= 1");
    }
    if config.retrieval.num_queries == 0 {
        anyhow::bail!("retrieval.num_queries must be >= 1");
    }
    if !(1..=3).contains(&config.retrieval.max_sources) {
        anyhow::bail!("retrieval.max_sources must be in [1, 3]");
    }

    if config.storage.allowed_extensions.is_empty() {
        anyhow::bail!("storage.allowed_extensions must not be empty");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hashed" => {}
        "openai" | "ollama" | "local" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashed, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    // Validate chat
    if config.chat.chunk_words == 0 {
        anyhow::bail!("chat.chunk_words must be > 0");
    }
    if let Some(default) = &config.chat.provider {
        if !config.chat.backends.contains_key(default) {
            anyhow::bail!(
                "chat.provider '{}' does not name a configured [chat.backends.*] entry",
                default
            );
        }
    }
    for (name, backend) in &config.chat.backends {
        if backend.kind == ChatBackendKind::Azure
            && (backend.url.is_none() || backend.api_version.is_none())
        {
            anyhow::bail!("chat.backends.{name}: azure requires url and api_version");
        }
    }

    Ok(())
}
