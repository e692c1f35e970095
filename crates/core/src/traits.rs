use crate::error::{ProviderError, StoreError};
use crate::models::{Document, DocumentStatus, PdfChunk};
use crate::store::{ChunkFilter, VectorHit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Writes a document's whole chunk set as one request.
    async fn upsert_chunks(
        &self,
        chunks: &[PdfChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError>;

    async fn search_vector(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<VectorHit>, StoreError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError>;

    /// Returns the number of chunks removed.
    async fn delete_all(&self) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, document: &Document) -> Result<(), StoreError>;

    async fn update(&self, document: &Document) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn find_by_path(&self, file_path: &str) -> Result<Option<Document>, StoreError>;

    async fn find_completed_by_hash(&self, content_hash: &str)
        -> Result<Option<Document>, StoreError>;

    async fn list(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>, StoreError>;

    /// Returns the number of documents removed.
    async fn delete_all(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn max_batch_size(&self) -> usize;

    /// One vector per input, in input order. No retries at this level.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

/// A break point suggested by the boundary-detection service. The segment starts
/// where `starts_with` is found in the page text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BoundaryProposal {
    pub starts_with: String,
    #[serde(default)]
    pub section_title: Option<String>,
    #[serde(default)]
    pub has_table: bool,
}

#[async_trait]
pub trait BoundaryDetector: Send + Sync {
    async fn propose_boundaries(
        &self,
        text: &str,
        page_number: u32,
    ) -> Result<Vec<BoundaryProposal>, ProviderError>;
}

/// Pairwise relevance model. Returns one raw logit per passage, in input order.
/// Implementations are shared across concurrent queries.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    fn model_name(&self) -> &str;

    async fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, ProviderError>;
}
