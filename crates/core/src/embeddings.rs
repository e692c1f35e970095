use crate::error::ProviderError;
use crate::providers::retry::{with_backoff, RetryPolicy};
use crate::traits::EmbeddingService;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Deterministic offline embedding: hashed character trigrams, L2 normalised.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingService for CharacterNgramEmbedder {
    fn model_name(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    fn max_batch_size(&self) -> usize {
        256
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// Batches, retries and validates calls to an [`EmbeddingService`].
///
/// A batch that still fails after retries fails the whole call, so callers
/// never see a partial result.
#[derive(Clone)]
pub struct Embedder {
    service: Arc<dyn EmbeddingService>,
    policy: RetryPolicy,
}

impl Embedder {
    pub fn new(service: Arc<dyn EmbeddingService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    pub fn dimensions(&self) -> usize {
        self.service.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.service.model_name()
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let batch_size = self.service.max_batch_size().max(1);
        let mut vectors = Vec::with_capacity(texts.len());

        for (batch_no, batch) in texts.chunks(batch_size).enumerate() {
            let service = &self.service;
            let embedded = with_backoff(&self.policy, "embed", move || service.embed_batch(batch)).await?;
            self.check_batch(batch.len(), &embedded)?;
            debug!(batch = batch_no, size = batch.len(), "embedded batch");
            vectors.extend(embedded);
        }

        Ok(vectors)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::MalformedResponse("no embedding returned".to_string()))
    }

    fn check_batch(&self, expected: usize, embedded: &[Vec<f32>]) -> Result<(), ProviderError> {
        if embedded.len() != expected {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {expected} embeddings, got {}",
                embedded.len()
            )));
        }

        let dimensions = self.service.dimensions();
        if let Some(vector) = embedded.iter().find(|vector| vector.len() != dimensions) {
            return Err(ProviderError::MalformedResponse(format!(
                "embedding width {} does not match configured {dimensions}",
                vector.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_secs(1),
        }
    }

    struct FlakyService {
        calls: AtomicUsize,
        fail_first: usize,
        width: usize,
    }

    #[async_trait]
    impl EmbeddingService for FlakyService {
        fn model_name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            4
        }

        fn max_batch_size(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(ProviderError::RateLimited {
                    retry_after: None,
                    details: "slow down".to_string(),
                });
            }
            Ok(texts
                .iter()
                .map(|text| vec![text.len() as f32; self.width])
                .collect())
        }
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow");
        let second = embedder.embed("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("abc");
        assert_eq!(vector.len(), 32);
    }

    #[tokio::test]
    async fn batches_preserve_input_order() -> Result<(), Box<dyn std::error::Error>> {
        let service = Arc::new(FlakyService {
            calls: AtomicUsize::new(0),
            fail_first: 1,
            width: 4,
        });
        let embedder = Embedder::new(service.clone(), fast_policy());
        let texts = ["a", "bb", "ccc", "dddd", "eeeee"].map(str::to_string).to_vec();

        let vectors = embedder.embed(&texts).await?;
        let firsts = vectors.iter().map(|vector| vector[0]).collect::<Vec<_>>();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        // three batches plus one retried rate limit
        assert_eq!(service.calls.load(Ordering::SeqCst), 4);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_whole_call() {
        let service = Arc::new(FlakyService {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            width: 4,
        });
        let embedder = Embedder::new(service, fast_policy());
        let result = embedder.embed(&["x".to_string()]).await;
        assert!(matches!(result, Err(ProviderError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn wrong_width_is_rejected() {
        let service = Arc::new(FlakyService {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            width: 3,
        });
        let embedder = Embedder::new(service, fast_policy());
        let result = embedder.embed(&["x".to_string()]).await;
        assert!(matches!(result, Err(ProviderError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn ngram_service_matches_direct_embedding() -> Result<(), Box<dyn std::error::Error>> {
        let ngram = CharacterNgramEmbedder { dimensions: 16 };
        let embedder = Embedder::new(Arc::new(ngram), RetryPolicy::default());
        let vector = embedder.embed_one("customer success").await?;
        assert_eq!(vector, ngram.embed("customer success"));
        Ok(())
    }
}
