use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::models::{Query, Response, RetrievalOptions};
use crate::rerank::Reranker;
use crate::retrieval::Retriever;
use crate::synthesis::{is_entity_query, AnswerSynthesizer};
use crate::traits::VectorIndex;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Query path: embed, retrieve, rerank, synthesize.
///
/// Holds no mutable state, so one coordinator can serve concurrent queries.
pub struct SearchCoordinator<V: VectorIndex + ?Sized> {
    embedder: Embedder,
    retriever: Retriever<V>,
    reranker: Reranker,
    synthesizer: AnswerSynthesizer,
    options: RetrievalOptions,
}

impl<V: VectorIndex + ?Sized> SearchCoordinator<V> {
    pub fn new(
        index: Arc<V>,
        embedder: Embedder,
        reranker: Reranker,
        synthesizer: AnswerSynthesizer,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            retriever: Retriever::new(index, options.min_usable, options.widen_factor),
            embedder,
            reranker,
            synthesizer,
            options,
        }
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    pub async fn ask(&self, question: &str) -> Result<Response, SearchError> {
        self.ask_with(question, self.options.top_k, self.options.max_sources)
            .await
    }

    pub async fn ask_with(
        &self,
        question: &str,
        top_k: usize,
        max_sources: usize,
    ) -> Result<Response, SearchError> {
        let started = Instant::now();

        let text = question.trim();
        if text.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let mut query = Query::new(text);

        let vector = self
            .embedder
            .embed_one(&query.text)
            .await
            .map_err(SearchError::Embedding)?;
        let query_vector: &[f32] = query.embedding.insert(vector);
        let embedded = started.elapsed();

        let entity = is_entity_query(&query.text);
        let k = if entity {
            top_k.saturating_mul(self.options.entity_widen_factor.max(1))
        } else {
            top_k
        };
        let candidates = self.retriever.retrieve(query_vector, k, None).await?;
        let retrieved = candidates.len();
        let searched = started.elapsed();

        let ranked = self
            .reranker
            .rerank(&query.text, candidates)
            .await
            .map_err(SearchError::Rerank)?;
        let reranked = started.elapsed();

        let mut response = self
            .synthesizer
            .synthesize(&query.text, &ranked, max_sources.max(1))
            .await?;
        response.metadata.chunks_retrieved = retrieved;
        response.metadata.processing_time_ms = started.elapsed().as_millis() as u64;

        info!(
            entity,
            k,
            retrieved,
            kept = ranked.len(),
            citations = response.citations.len(),
            not_found = response.not_found,
            embed_ms = embedded.as_millis() as u64,
            search_ms = (searched - embedded).as_millis() as u64,
            rerank_ms = (reranked - searched).as_millis() as u64,
            generate_ms = (started.elapsed() - reranked).as_millis() as u64,
            "answered query"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::ProviderError;
    use crate::providers::RetryPolicy;
    use crate::rerank::LexicalCrossEncoder;
    use crate::stores::InMemoryVectorIndex;
    use crate::traits::{GenerationRequest, GenerationService};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationService for CountingGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(r#"{"answer": "", "citations": [], "not_found": true}"#.to_string())
        }
    }

    fn coordinator(generator: Arc<CountingGenerator>) -> SearchCoordinator<InMemoryVectorIndex> {
        let policy = RetryPolicy::no_retries(Duration::from_secs(5));
        let embedder = Embedder::new(Arc::new(CharacterNgramEmbedder::new(64)), policy.clone());
        SearchCoordinator::new(
            Arc::new(InMemoryVectorIndex::new(64)),
            embedder,
            Reranker::new(Arc::new(LexicalCrossEncoder::new()), 0.1),
            AnswerSynthesizer::new(generator, policy, 3),
            RetrievalOptions::default(),
        )
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let coordinator = coordinator(Arc::new(CountingGenerator::default()));
        assert!(matches!(coordinator.ask("   ").await, Err(SearchError::EmptyQuery)));
    }

    #[tokio::test]
    async fn empty_index_is_not_found_without_generation() -> Result<(), Box<dyn std::error::Error>> {
        let generator = Arc::new(CountingGenerator::default());
        let response = coordinator(generator.clone()).ask("What is the definition of CSM?").await?;

        assert!(response.not_found);
        assert_eq!(response.metadata.chunks_retrieved, 0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
