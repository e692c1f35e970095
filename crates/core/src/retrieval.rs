use crate::error::StoreError;
use crate::models::Candidate;
use crate::store::{ChunkFilter, VectorHit};
use crate::traits::VectorIndex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// First-stage retrieval over the vector index.
///
/// A filtered search that returns fewer than `min_usable` hits is backfilled
/// with one unfiltered search of `k * widen_factor`. Results are deduplicated
/// by chunk id, keeping the best score, and never exceed `k`.
pub struct Retriever<V: VectorIndex + ?Sized> {
    index: Arc<V>,
    min_usable: usize,
    widen_factor: usize,
}

impl<V: VectorIndex + ?Sized> Retriever<V> {
    pub fn new(index: Arc<V>, min_usable: usize, widen_factor: usize) -> Self {
        Self {
            index,
            min_usable,
            widen_factor: widen_factor.max(1),
        }
    }

    pub async fn retrieve(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<Candidate>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut hits = self.index.search_vector(query_vector, k, filter).await?;

        if filter.is_some() && hits.len() < self.min_usable {
            let widened = k.saturating_mul(self.widen_factor);
            debug!(found = hits.len(), widened, "widening vector search without filter");
            hits.extend(self.index.search_vector(query_vector, widened, None).await?);
        }

        Ok(rank_hits(hits, k))
    }
}

fn rank_hits(hits: Vec<VectorHit>, k: usize) -> Vec<Candidate> {
    let mut best: HashMap<String, VectorHit> = HashMap::with_capacity(hits.len());
    for hit in hits {
        match best.get(&hit.chunk.chunk_id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(hit.chunk.chunk_id.clone(), hit);
            }
        }
    }

    let mut ranked = best.into_values().collect::<Vec<_>>();
    ranked.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.chunk.chunk_id.cmp(&right.chunk.chunk_id))
    });
    ranked.truncate(k);
    ranked.into_iter().map(VectorHit::into_candidate).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, PdfChunk};
    use crate::stores::InMemoryVectorIndex;

    fn chunk(id: &str) -> PdfChunk {
        chunk_in("doc", id)
    }

    fn chunk_in(document: &str, id: &str) -> PdfChunk {
        PdfChunk {
            chunk_id: id.to_string(),
            document_id: document.to_string(),
            document_name: "doc.pdf".to_string(),
            content: format!("text {id}"),
            page_start: 1,
            page_end: None,
            chunk_index: 0,
            metadata: ChunkMetadata::default(),
        }
    }

    #[test]
    fn duplicates_keep_best_score_and_order_descends() {
        let hits = vec![
            VectorHit { chunk: chunk("a"), score: 0.4 },
            VectorHit { chunk: chunk("b"), score: 0.9 },
            VectorHit { chunk: chunk("a"), score: 0.7 },
        ];

        let ranked = rank_hits(hits, 10);
        let ids = ranked.iter().map(|c| c.chunk.chunk_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "a"]);
        assert!((ranked[1].similarity - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn results_never_exceed_k() -> Result<(), Box<dyn std::error::Error>> {
        let index = Arc::new(InMemoryVectorIndex::new(2));
        let chunks = (0..8).map(|i| chunk(&format!("c{i}"))).collect::<Vec<_>>();
        let vectors = (0..8).map(|i| vec![1.0, i as f32 * 0.1]).collect::<Vec<_>>();
        index.upsert_chunks(&chunks, &vectors).await?;

        let retriever = Retriever::new(index, 5, 3);
        let candidates = retriever.retrieve(&[1.0, 0.0], 3, None).await?;
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].chunk.chunk_id, "c0");
        Ok(())
    }

    #[tokio::test]
    async fn sparse_filtered_search_is_backfilled() -> Result<(), Box<dyn std::error::Error>> {
        let index = Arc::new(InMemoryVectorIndex::new(2));
        let chunks = vec![chunk_in("manual", "m0"), chunk_in("memo", "n0"), chunk_in("memo", "n1")];
        let vectors = vec![vec![0.2, 1.0], vec![1.0, 0.0], vec![1.0, 0.1]];
        index.upsert_chunks(&chunks, &vectors).await?;
        let filter = ChunkFilter {
            document_id: Some("manual".to_string()),
            ..ChunkFilter::default()
        };

        let sparse = Retriever::new(index.clone(), 2, 3).retrieve(&[1.0, 0.0], 2, Some(&filter)).await?;
        let ids = sparse.iter().map(|c| c.chunk.chunk_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["n0", "n1"]);

        let satisfied = Retriever::new(index, 1, 3).retrieve(&[1.0, 0.0], 2, Some(&filter)).await?;
        let ids = satisfied.iter().map(|c| c.chunk.chunk_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["m0"]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_index_returns_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let retriever = Retriever::new(Arc::new(InMemoryVectorIndex::new(2)), 5, 3);
        assert!(retriever.retrieve(&[1.0, 0.0], 30, None).await?.is_empty());
        Ok(())
    }
}
