pub mod chunking;
pub mod citation;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod rerank;
pub mod retrieval;
pub mod store;
pub mod stores;
pub mod synthesis;
pub mod text;
pub mod traits;

pub use chunking::{build_chunks, ChunkingConfig, SemanticChunker};
pub use citation::{validate_quote, CitationRejection};
pub use config::Settings;
pub use embeddings::{CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{ConfigError, IngestError, ProviderError, SearchError, StoreError};
pub use extractor::{LopdfExtractor, PageText, PdfExtractor};
pub use ingest::{discover_pdf_files, IndexStatus, Indexer, IndexingSummary};
pub use models::{
    Candidate, Citation, Document, DocumentOutcome, DocumentStatus, IngestionOptions, OutcomeKind,
    PdfChunk, Response, ResponseMetadata, RetrievalOptions, SkipReason,
};
pub use orchestrator::SearchCoordinator;
pub use providers::{OpenAiClient, RetryPolicy};
pub use rerank::{HttpCrossEncoder, LexicalCrossEncoder, Reranker};
pub use retrieval::Retriever;
pub use stores::{InMemoryDocumentStore, InMemoryVectorIndex, QdrantStore, SqliteDocumentStore};
pub use synthesis::AnswerSynthesizer;
pub use traits::{
    BoundaryDetector, CrossEncoder, DocumentStore, EmbeddingService, GenerationService, VectorIndex,
};

#[cfg(feature = "local-rerank")]
pub use rerank::FastembedCrossEncoder;
