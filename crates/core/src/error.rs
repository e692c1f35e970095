use crate::models::{DocumentStatus, SkipReason};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unreadable pdf {path}: {details}")]
    Unreadable { path: String, details: String },

    #[error("pdf is encrypted: {path}")]
    Encrypted { path: String },

    #[error("pdf has no extractable text: {path}")]
    NoExtractableText { path: String },

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("document {document_id} cannot move from {from} to {to}")]
    InvalidTransition {
        document_id: String,
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("extraction task failed: {0}")]
    Task(String),
}

impl IngestError {
    /// Per-file problems that skip the document instead of counting as a failure.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Encrypted { .. } => Some(SkipReason::Encrypted),
            Self::Unreadable { details, .. } => Some(SkipReason::Unreadable(details.clone())),
            Self::NoExtractableText { .. } => Some(SkipReason::NoExtractableText),
            _ => None,
        }
    }
}

/// Failures of the external embedding, generation, boundary-detection and rerank services.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited by provider: {details}")]
    RateLimited {
        retry_after: Option<Duration>,
        details: String,
    },

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider rejected request ({status}): {details}")]
    Rejected { status: u16, details: String },

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transient(_) | Self::Timeout(_) => true,
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("store request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("query embedding failed: {0}")]
    Embedding(#[source] ProviderError),

    #[error("vector search failed: {0}")]
    Store(#[from] StoreError),

    #[error("reranking failed: {0}")]
    Rerank(#[source] ProviderError),

    #[error("answer generation unavailable: {0}")]
    GenerationUnavailable(#[source] ProviderError),
}

impl SearchError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Embedding(error) | Self::Rerank(error) | Self::GenerationUnavailable(error) => {
                error.is_rate_limited()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
