//! In-memory stores for tests and `vector_backend = "memory"`.
//!
//! Vector search is brute-force cosine similarity over every stored vector.

use crate::error::StoreError;
use crate::models::{Document, DocumentStatus, PdfChunk};
use crate::store::{cosine_similarity, ChunkFilter, VectorHit};
use crate::traits::{DocumentStore, VectorIndex};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct StoredVector {
    chunk: PdfChunk,
    vector: Vec<f32>,
}

pub struct InMemoryVectorIndex {
    dimensions: usize,
    points: RwLock<Vec<StoredVector>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            points: RwLock::new(Vec::new()),
        }
    }

    /// Stored chunks of one document, in chunk order.
    pub async fn chunks_for(&self, document_id: &str) -> Vec<PdfChunk> {
        let points = self.points.read().await;
        let mut chunks = points
            .iter()
            .filter(|point| point.chunk.document_id == document_id)
            .map(|point| point.chunk.clone())
            .collect::<Vec<_>>();
        chunks.sort_by_key(|chunk| chunk.chunk_index);
        chunks
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn upsert_chunks(
        &self,
        chunks: &[PdfChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        if chunks.len() != embeddings.len() {
            return Err(StoreError::Request(format!(
                "embedding count {} doesn't match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }
        if let Some(bad) = embeddings.iter().find(|vector| vector.len() != self.dimensions) {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.len(),
            });
        }

        let mut points = self.points.write().await;
        for (chunk, vector) in chunks.iter().zip(embeddings) {
            points.retain(|point| point.chunk.chunk_id != chunk.chunk_id);
            points.push(StoredVector {
                chunk: chunk.clone(),
                vector: vector.clone(),
            });
        }
        Ok(())
    }

    async fn search_vector(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<VectorHit>, StoreError> {
        if query_vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: query_vector.len(),
            });
        }

        let points = self.points.read().await;
        let mut hits = points
            .iter()
            .filter(|point| filter.map_or(true, |filter| filter.matches(&point.chunk)))
            .map(|point| VectorHit {
                chunk: point.chunk.clone(),
                score: cosine_similarity(query_vector, &point.vector) as f64,
            })
            .collect::<Vec<_>>();

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        self.points
            .write()
            .await
            .retain(|point| point.chunk.document_id != document_id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let mut points = self.points.write().await;
        let removed = points.len();
        points.clear();
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.points.read().await.len())
    }
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, document: &Document) -> Result<(), StoreError> {
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn update(&self, document: &Document) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        match documents.get_mut(&document.id) {
            Some(stored) => {
                *stored = document.clone();
                Ok(())
            }
            None => Err(StoreError::Request(format!("unknown document {}", document.id))),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn find_by_path(&self, file_path: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .values()
            .find(|document| document.file_path == file_path)
            .cloned())
    }

    async fn find_completed_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .values()
            .filter(|document| {
                document.content_hash == content_hash && document.status == DocumentStatus::Completed
            })
            .min_by_key(|document| document.indexed_at)
            .cloned())
    }

    async fn list(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>, StoreError> {
        let mut documents = self
            .documents
            .read()
            .await
            .values()
            .filter(|document| status.map_or(true, |status| document.status == status))
            .cloned()
            .collect::<Vec<_>>();
        documents.sort_by(|left, right| left.name.cmp(&right.name).then(left.id.cmp(&right.id)));
        Ok(documents)
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let mut documents = self.documents.write().await;
        let removed = documents.len();
        documents.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn chunk(id: &str, document_id: &str, index: u32, has_table: bool) -> PdfChunk {
        PdfChunk {
            chunk_id: id.to_string(),
            document_id: document_id.to_string(),
            document_name: format!("{document_id}.pdf"),
            content: format!("content of {id}"),
            page_start: 1,
            page_end: None,
            chunk_index: index,
            metadata: ChunkMetadata {
                has_table,
                ..ChunkMetadata::default()
            },
        }
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_and_honours_filter() -> Result<(), Box<dyn std::error::Error>> {
        let index = InMemoryVectorIndex::new(2);
        index
            .upsert_chunks(
                &[chunk("a", "d1", 0, false), chunk("b", "d2", 0, true), chunk("c", "d1", 1, false)],
                &[vec![1.0, 0.0], vec![0.7, 0.7], vec![0.0, 1.0]],
            )
            .await?;

        let hits = index.search_vector(&[1.0, 0.1], 3, None).await?;
        let ids = hits.iter().map(|hit| hit.chunk.chunk_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let filter = ChunkFilter {
            document_id: Some("d1".to_string()),
            has_table: None,
        };
        let hits = index.search_vector(&[1.0, 0.1], 3, Some(&filter)).await?;
        assert!(hits.iter().all(|hit| hit.chunk.document_id == "d1"));
        assert_eq!(hits.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_width_is_rejected() {
        let index = InMemoryVectorIndex::new(3);
        let result = index.upsert_chunks(&[chunk("a", "d", 0, false)], &[vec![1.0]]).await;
        assert!(matches!(result, Err(StoreError::DimensionMismatch { expected: 3, actual: 1 })));
    }

    #[tokio::test]
    async fn delete_document_cascades_only_its_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let index = InMemoryVectorIndex::new(1);
        index
            .upsert_chunks(
                &[chunk("a", "d1", 0, false), chunk("b", "d2", 0, false)],
                &[vec![1.0], vec![1.0]],
            )
            .await?;

        index.delete_document("d1").await?;
        assert_eq!(index.count().await?, 1);
        assert!(index.chunks_for("d1").await.is_empty());
        assert_eq!(index.delete_all().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn documents_are_queryable_by_status_and_hash() -> Result<(), Box<dyn std::error::Error>> {
        let store = InMemoryDocumentStore::new();
        let mut done = Document::new("1", "b.pdf", "/b.pdf", 3, "h1");
        done.mark_processing()?;
        done.mark_completed(4)?;
        store.insert(&done).await?;
        store.insert(&Document::new("2", "a.pdf", "/a.pdf", 1, "h2")).await?;

        assert_eq!(store.find_completed_by_hash("h1").await?.map(|d| d.id), Some("1".to_string()));
        assert!(store.find_completed_by_hash("h2").await?.is_none());
        assert_eq!(store.list(Some(DocumentStatus::Pending)).await?.len(), 1);
        let names = store.list(None).await?.into_iter().map(|d| d.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["a.pdf", "b.pdf"]);
        assert!(store.find_by_path("/a.pdf").await?.is_some());
        Ok(())
    }
}
