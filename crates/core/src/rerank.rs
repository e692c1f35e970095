//! Second-stage relevance scoring.
//!
//! A [`CrossEncoder`] scores every (query, passage) pair independently. The
//! [`Reranker`] maps raw logits through the logistic function so scores are
//! comparable across queries, orders candidates by that score and drops the
//! ones below the relevance floor.

use crate::error::ProviderError;
use crate::models::Candidate;
use crate::providers::openai::{check_status, classify_transport_error};
use crate::traits::CrossEncoder;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub struct Reranker {
    model: Arc<dyn CrossEncoder>,
    relevance_floor: f64,
}

impl Reranker {
    pub fn new(model: Arc<dyn CrossEncoder>, relevance_floor: f64) -> Self {
        Self {
            model,
            relevance_floor: relevance_floor.clamp(0.0, 1.0),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Scores, sorts and floor-truncates `candidates`. Ties keep their incoming
    /// (similarity) order.
    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, ProviderError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let passages = candidates
            .iter()
            .map(|candidate| candidate.chunk.content.as_str())
            .collect::<Vec<_>>();
        let logits = self.model.score_pairs(query, &passages).await?;

        if logits.len() != candidates.len() {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {} rerank scores, got {}",
                candidates.len(),
                logits.len()
            )));
        }

        for (candidate, logit) in candidates.iter_mut().zip(logits) {
            candidate.rerank_score = Some(normalize_logit(logit));
        }

        candidates.sort_by(|left, right| {
            let left = left.rerank_score.unwrap_or(0.0);
            let right = right.rerank_score.unwrap_or(0.0);
            right.total_cmp(&left)
        });

        let before = candidates.len();
        candidates.retain(|candidate| candidate.rerank_score.unwrap_or(0.0) >= self.relevance_floor);
        debug!(
            model = self.model.model_name(),
            kept = candidates.len(),
            dropped = before - candidates.len(),
            floor = self.relevance_floor,
            "reranked candidates"
        );
        Ok(candidates)
    }
}

/// Logistic function, rounded to four decimals.
pub fn normalize_logit(logit: f32) -> f64 {
    let score = 1.0 / (1.0 + (-f64::from(logit)).exp());
    (score * 10_000.0).round() / 10_000.0
}

const STOPWORDS: &[&str] = &[
    "a", "about", "all", "an", "and", "any", "are", "as", "at", "be", "been", "by", "can", "could",
    "did", "do", "does", "for", "from", "give", "had", "has", "have", "how", "i", "in", "into",
    "is", "it", "its", "list", "many", "me", "much", "name", "of", "on", "or", "our", "tell",
    "that", "the", "their", "there", "these", "this", "those", "to", "was", "we", "were", "what",
    "when", "where", "which", "who", "whom", "why", "will", "with", "would", "you",
];

const PREFIX_CHARS: usize = 5;

/// Deterministic term-coverage model. The logit grows with the share of query
/// terms found in the passage, with a bonus for query word pairs that appear
/// next to each other.
#[derive(Debug, Clone, Default)]
pub struct LexicalCrossEncoder;

impl LexicalCrossEncoder {
    pub fn new() -> Self {
        Self
    }

    pub fn logit(&self, query: &str, passage: &str) -> f32 {
        let terms = query_terms(query);
        if terms.is_empty() {
            return -4.0;
        }

        let words = tokenize(passage);
        let vocabulary = words.iter().map(String::as_str).collect::<HashSet<_>>();

        let matched = terms
            .iter()
            .filter(|term| vocabulary.iter().any(|word| terms_match(term, word)))
            .count();
        let coverage = matched as f32 / terms.len() as f32;

        let bonus = if terms.len() > 1 {
            let pairs = terms.windows(2).count() as f32;
            let adjacent = terms
                .windows(2)
                .filter(|pair| {
                    words
                        .windows(2)
                        .any(|seen| terms_match(&pair[0], &seen[0]) && terms_match(&pair[1], &seen[1]))
                })
                .count() as f32;
            2.0 * adjacent / pairs
        } else {
            0.0
        };

        8.0 * coverage - 4.0 + bonus
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .filter(|word| seen.insert(word.clone()))
        .collect()
}

fn terms_match(term: &str, word: &str) -> bool {
    if term == word {
        return true;
    }
    if term.chars().count() < PREFIX_CHARS || word.chars().count() < PREFIX_CHARS {
        return false;
    }
    term.chars().take(PREFIX_CHARS).eq(word.chars().take(PREFIX_CHARS))
}

#[async_trait]
impl CrossEncoder for LexicalCrossEncoder {
    fn model_name(&self) -> &str {
        "lexical-coverage"
    }

    async fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, ProviderError> {
        Ok(passages.iter().map(|passage| self.logit(query, passage)).collect())
    }
}

/// Cross-encoder served over HTTP with the text-embeddings-inference `/rerank`
/// contract: `{query, texts}` in, `[{index, score}]` out.
pub struct HttpCrossEncoder {
    endpoint: String,
    model: String,
    timeout: Duration,
    client: Client,
}

impl HttpCrossEncoder {
    pub fn new(endpoint: &str, model: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|error| ProviderError::Rejected {
                status: 0,
                details: format!("invalid rerank endpoint {endpoint}: {error}"),
            })?
            .as_str()
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            endpoint,
            model: model.into(),
            timeout,
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/rerank", self.endpoint))
            .json(&json!({ "query": query, "texts": passages, "raw_scores": true }))
            .send()
            .await
            .map_err(|error| classify_transport_error(error, self.timeout))?;

        let parsed: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|error| classify_transport_error(error, self.timeout))?;
        parse_rerank_scores(&parsed, passages.len())
    }
}

fn parse_rerank_scores(parsed: &Value, expected: usize) -> Result<Vec<f32>, ProviderError> {
    let items = parsed
        .as_array()
        .ok_or_else(|| ProviderError::MalformedResponse("rerank response is not an array".to_string()))?;

    let mut scores = vec![None; expected];
    for item in items {
        let index = item
            .pointer("/index")
            .and_then(Value::as_u64)
            .map(|index| index as usize)
            .filter(|index| *index < expected)
            .ok_or_else(|| ProviderError::MalformedResponse(format!("bad rerank index in {item}")))?;
        let score = item
            .pointer("/score")
            .and_then(Value::as_f64)
            .ok_or_else(|| ProviderError::MalformedResponse(format!("rerank item {index} has no score")))?;
        scores[index] = Some(score as f32);
    }

    scores
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ProviderError::MalformedResponse("rerank response is missing passages".to_string()))
}

/// Runs CPU-bound model work on the blocking pool. Works on both runtime flavours.
#[cfg_attr(not(feature = "local-rerank"), allow(dead_code))]
async fn run_blocking<T, F>(work: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| ProviderError::Transient(format!("rerank task failed: {error}")))?
}

#[cfg(feature = "local-rerank")]
pub use local::FastembedCrossEncoder;

#[cfg(feature = "local-rerank")]
mod local {
    use super::*;
    use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
    use std::sync::{Arc, Mutex};

    /// ONNX cross-encoder run in-process on the blocking pool. The session is
    /// not reentrant, so calls are serialized through a mutex.
    pub struct FastembedCrossEncoder {
        model_name: String,
        model: Arc<Mutex<TextRerank>>,
    }

    impl FastembedCrossEncoder {
        pub fn load(model_name: &str) -> Result<Self, ProviderError> {
            let kind = match model_name {
                "BAAI/bge-reranker-base" => RerankerModel::BGERerankerBase,
                "jinaai/jina-reranker-v1-turbo-en" => RerankerModel::JINARerankerV1TurboEn,
                other => return Err(ProviderError::UnsupportedModel(other.to_string())),
            };

            let model = TextRerank::try_new(RerankInitOptions::new(kind))
                .map_err(|error| ProviderError::UnsupportedModel(format!("{model_name}: {error}")))?;
            tracing::info!(model = model_name, "loaded rerank model");

            Ok(Self {
                model_name: model_name.to_string(),
                model: Arc::new(Mutex::new(model)),
            })
        }
    }

    #[async_trait]
    impl CrossEncoder for FastembedCrossEncoder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        async fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, ProviderError> {
            let model = Arc::clone(&self.model);
            let query = query.to_string();
            let documents = passages.iter().map(|passage| passage.to_string()).collect::<Vec<_>>();

            let results = run_blocking(move || {
                let mut model = model
                    .lock()
                    .map_err(|_| ProviderError::Transient("rerank model lock poisoned".to_string()))?;
                model
                    .rerank(query, documents, false, None)
                    .map_err(|error| ProviderError::MalformedResponse(error.to_string()))
            })
            .await?;

            let mut scores = vec![0.0f32; passages.len()];
            for result in results {
                if let Some(slot) = scores.get_mut(result.index) {
                    *slot = result.score;
                }
            }
            Ok(scores)
        }
    }
}
