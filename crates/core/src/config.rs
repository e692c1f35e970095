use crate::chunking::ChunkingConfig;
use crate::error::ConfigError;
use crate::models::{IngestionOptions, RetrievalOptions};
use crate::providers::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "pdf-rag.toml";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DATA_DIR_ENV: &str = "PDF_RAG_DATA_DIR";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub provider: ProviderSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub rerank: RerankSettings,
    pub storage: StorageSettings,
    pub indexing: IndexingSettings,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub chat_model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub embedding_batch_size: usize,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            embedding_model: "text-embedding-3-large".to_string(),
            embedding_dimensions: 3072,
            chat_model: "gpt-4o".to_string(),
            timeout_secs: 60,
            max_retries: 5,
            embedding_batch_size: 50,
        }
    }
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            timeout: self.timeout(),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub max_tokens: usize,
    pub min_chars: usize,
    pub chars_per_token: usize,
    pub max_detector_input_chars: usize,
    pub semantic_boundaries: bool,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        let config = ChunkingConfig::default();
        Self {
            max_tokens: config.max_tokens,
            min_chars: config.min_chars,
            chars_per_token: config.chars_per_token,
            max_detector_input_chars: config.max_detector_input_chars,
            semantic_boundaries: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub min_usable: usize,
    pub widen_factor: usize,
    pub entity_widen_factor: usize,
    pub max_sources: usize,
    pub max_chunks_per_document: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        let options = RetrievalOptions::default();
        Self {
            top_k: options.top_k,
            min_usable: options.min_usable,
            widen_factor: options.widen_factor,
            entity_widen_factor: options.entity_widen_factor,
            max_sources: options.max_sources,
            max_chunks_per_document: options.max_chunks_per_document,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RerankKind {
    #[default]
    Lexical,
    Http,
    Fastembed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub kind: RerankKind,
    pub model: String,
    pub endpoint: Option<String>,
    pub relevance_floor: f64,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            kind: RerankKind::Lexical,
            model: "BAAI/bge-reranker-base".to_string(),
            endpoint: None,
            relevance_floor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub metadata_db: String,
    pub vector_backend: VectorBackend,
    pub qdrant_url: String,
    pub qdrant_collection: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metadata_db: "metadata.db".to_string(),
            vector_backend: VectorBackend::Qdrant,
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_collection: "pdf_chunks".to_string(),
        }
    }
}

impl StorageSettings {
    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.metadata_db)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexingSettings {
    pub workers: usize,
    pub recursive: bool,
}

impl Default for IndexingSettings {
    fn default() -> Self {
        let options = IngestionOptions::default();
        Self {
            workers: options.workers,
            recursive: options.recursive,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from the first standard location that
    /// exists, then applies environment overrides. Missing files mean defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let located = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_locations().into_iter().find(|candidate| candidate.exists()),
        };

        let mut settings = match located {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(key) = non_empty_env(API_KEY_ENV) {
            self.provider.api_key = Some(key);
        }
        if let Some(dir) = non_empty_env(DATA_DIR_ENV) {
            self.storage.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunking = &self.chunking;
        if chunking.max_tokens == 0 || chunking.chars_per_token == 0 {
            return Err(ConfigError::Invalid(
                "chunking.max_tokens and chunking.chars_per_token must be > 0".to_string(),
            ));
        }
        if chunking.min_chars >= self.chunking_config().max_chars() {
            return Err(ConfigError::Invalid(
                "chunking.min_chars must be smaller than the chunk ceiling".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 || self.retrieval.max_sources == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.top_k and retrieval.max_sources must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rerank.relevance_floor) {
            return Err(ConfigError::Invalid(
                "rerank.relevance_floor must be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.provider.embedding_dimensions == 0 {
            return Err(ConfigError::Invalid(
                "provider.embedding_dimensions must be > 0".to_string(),
            ));
        }
        if self.rerank.kind == RerankKind::Http && self.rerank.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "rerank.endpoint is required when rerank.kind = \"http\"".to_string(),
            ));
        }
        if self.provider.kind == ProviderKind::OpenAi
            && self.provider.api_key.as_deref().map_or(true, |key| key.trim().is_empty())
        {
            return Err(ConfigError::MissingCredentials(format!(
                "set {API_KEY_ENV} or provider.api_key"
            )));
        }
        Ok(())
    }

    pub fn chunking_config(&self) -> ChunkingConfig {
        ChunkingConfig {
            max_tokens: self.chunking.max_tokens,
            min_chars: self.chunking.min_chars,
            chars_per_token: self.chunking.chars_per_token,
            max_detector_input_chars: self.chunking.max_detector_input_chars,
            ..ChunkingConfig::default()
        }
    }

    pub fn retrieval_options(&self) -> RetrievalOptions {
        RetrievalOptions {
            top_k: self.retrieval.top_k,
            min_usable: self.retrieval.min_usable,
            widen_factor: self.retrieval.widen_factor,
            entity_widen_factor: self.retrieval.entity_widen_factor,
            max_sources: self.retrieval.max_sources,
            max_chunks_per_document: self.retrieval.max_chunks_per_document,
        }
    }

    pub fn ingestion_options(&self, force: bool) -> IngestionOptions {
        IngestionOptions {
            recursive: self.indexing.recursive,
            force,
            workers: self.indexing.workers.max(1),
        }
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut locations = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(home) = std::env::var_os("HOME") {
        locations.push(PathBuf::from(home).join(".pdf-rag").join("config.toml"));
    }
    locations
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
