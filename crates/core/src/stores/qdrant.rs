use crate::error::StoreError;
use crate::models::PdfChunk;
use crate::store::{ChunkFilter, VectorHit};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Vector index backed by the Qdrant REST API. Chunk fields travel in the
/// point payload, so search results need no second lookup. Every request is
/// bounded by the client timeout.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl AsRef<str>,
        collection: impl Into<String>,
        vector_size: usize,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let endpoint = Url::parse(endpoint.as_ref())?;
        Ok(Self {
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::builder().timeout(timeout).build()?,
            vector_size,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    /// Creates the collection with cosine distance if it is missing, or checks
    /// that an existing one has the configured vector size.
    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let response = self.client.get(self.collection_url()).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            let response = self
                .client
                .put(self.collection_url())
                .json(&json!({
                    "vectors": { "size": self.vector_size, "distance": "Cosine" },
                }))
                .send()
                .await?;
            check(response).await?;
            info!(collection = %self.collection, size = self.vector_size, "created qdrant collection");
            return Ok(());
        }

        let parsed: Value = check(response).await?.json().await?;
        let existing = parsed
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .map(|size| size as usize);

        match existing {
            Some(size) if size != self.vector_size => Err(StoreError::DimensionMismatch {
                expected: size,
                actual: self.vector_size,
            }),
            _ => Ok(()),
        }
    }
}

/// Qdrant only accepts integers or UUIDs as point ids.
pub fn point_id(chunk_id: &str) -> String {
    let hex: String = chunk_id
        .chars()
        .filter(char::is_ascii_hexdigit)
        .chain(std::iter::repeat('0'))
        .take(32)
        .collect::<String>()
        .to_ascii_lowercase();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn filter_json(filter: &ChunkFilter) -> Value {
    let mut must = Vec::new();
    if let Some(document_id) = &filter.document_id {
        must.push(json!({ "key": "document_id", "match": { "value": document_id } }));
    }
    if let Some(has_table) = filter.has_table {
        must.push(json!({ "key": "metadata.has_table", "match": { "value": has_table } }));
    }
    json!({ "must": must })
}

async fn check(response: Response) -> Result<Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::BackendResponse {
        backend: "qdrant".to_string(),
        details: format!("{status}: {body}"),
    })
}

#[async_trait]
impl VectorIndex for QdrantStore {
    fn dimensions(&self) -> usize {
        self.vector_size
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

        let points = chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, embedding)| {
                if embedding.len() != self.vector_size {
                    return Err(StoreError::DimensionMismatch {
                        expected: self.vector_size,
                        actual: embedding.len(),
                    });
                }

                Ok(json!({
                    "id": point_id(&chunk.chunk_id),
                    "vector": embedding,
                    "payload": serde_json::to_value(chunk)?,
                }))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check(response).await?;
        debug!(collection = %self.collection, points = chunks.len(), "upserted points");
        Ok(())
    }

    async fn search_vector(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<VectorHit>, StoreError> {
        if query_vector.len() != self.vector_size {
            return Err(StoreError::DimensionMismatch {
                expected: self.vector_size,
                actual: query_vector.len(),
            });
        }

        let mut body = json!({
            "vector": query_vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter_json(filter);
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&body)
            .send()
            .await?;
        let parsed: Value = check(response).await?.json().await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        hits.into_iter()
            .map(|hit| {
                let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
                let payload = hit.pointer("/payload").cloned().ok_or_else(|| StoreError::BackendResponse {
                    backend: "qdrant".to_string(),
                    details: "search hit without payload".to_string(),
                })?;
                let chunk: PdfChunk = serde_json::from_value(payload)?;
                Ok(VectorHit { chunk, score })
            })
            .collect()
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let filter = ChunkFilter {
            document_id: Some(document_id.to_string()),
            has_table: None,
        };
        let response = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&json!({ "filter": filter_json(&filter) }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let removed = self.count().await?;
        let response = self.client.delete(self.collection_url()).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            check(response).await?;
        }
        self.ensure_collection().await?;
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let response = self
            .client
            .post(format!("{}/points/count", self.collection_url()))
            .json(&json!({ "exact": true }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let parsed: Value = check(response).await?.json().await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_uuid_shaped_and_stable() {
        let chunk_id = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        let id = point_id(chunk_id);
        assert_eq!(id, "9f86d081-884c-7d65-9a2f-eaa0c55ad015");
        assert_eq!(id, point_id(chunk_id));
    }

    #[test]
    fn short_ids_are_padded() {
        assert_eq!(point_id("abc"), "abc00000-0000-0000-0000-000000000000");
    }

    #[test]
    fn filter_builds_must_clauses() {
        let filter = ChunkFilter {
            document_id: Some("doc".to_string()),
            has_table: Some(true),
        };
        let value = filter_json(&filter);
        assert_eq!(value["must"][0]["key"], "document_id");
        assert_eq!(value["must"][1]["match"]["value"], true);
    }

    #[test]
    fn endpoint_must_be_a_url() {
        assert!(matches!(
            QdrantStore::new("not a url", "pdf_chunks", 8, Duration::from_secs(5)),
            Err(StoreError::Url(_))
        ));
        let store = QdrantStore::new("http://localhost:6333/", "pdf_chunks", 8, Duration::from_secs(5));
        assert!(store.is_ok_and(|store| store.collection_url() == "http://localhost:6333/collections/pdf_chunks"));
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let store = QdrantStore::new(format!("http://{address}"), "pdf_chunks", 8, Duration::from_millis(200))?;
        let result = tokio::time::timeout(Duration::from_secs(5), store.count()).await?;
        server.abort();

        assert!(matches!(result, Err(StoreError::Http(error)) if error.is_timeout()));
        Ok(())
    }
}
