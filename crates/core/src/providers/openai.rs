use crate::config::ProviderSettings;
use crate::error::ProviderError;
use crate::traits::{
    BoundaryDetector, BoundaryProposal, EmbeddingService, GenerationRequest, GenerationService,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const BOUNDARY_SYSTEM_PROMPT: &str = r#"You split document pages into semantically coherent sections for a retrieval index.

Read the page text and propose where each section begins. A section is a paragraph group, a titled section, a list, or a table that can be understood on its own.

Rules:
1. "starts_with" must be copied exactly from the page text: the first 5 to 12 words of the section.
2. Proposals must follow the order of the text and must not overlap.
3. Set "section_title" when the section has a heading, otherwise null.
4. Set "has_table" to true when the section is tabular data.

Return ONLY a JSON object:
{"segments": [{"starts_with": "...", "section_title": "..." , "has_table": false}]}"#;

/// Client for OpenAI-compatible `/embeddings` and `/chat/completions` endpoints.
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    embedding_model: String,
    dimensions: usize,
    chat_model: String,
    batch_size: usize,
    timeout: Duration,
    client: Client,
}

impl OpenAiClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ProviderError::MissingCredentials("openai api key".to_string()))?
            .to_string();

        let client = Client::builder().timeout(settings.timeout()).build()?;

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            embedding_model: settings.embedding_model.clone(),
            dimensions: settings.embedding_dimensions,
            chat_model: settings.chat_model.clone(),
            batch_size: settings.embedding_batch_size.max(1),
            timeout: settings.timeout(),
            client,
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|error| classify_transport_error(error, self.timeout))?;

        let response = check_status(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|error| classify_transport_error(error, self.timeout))
    }

    async fn chat_json(
        &self,
        system_prompt: &str,
        user_message: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.chat_model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_message },
            ],
            "temperature": temperature,
            "max_tokens": max_tokens,
            "response_format": { "type": "json_object" },
        });

        let parsed = self.post_json("/chat/completions", &body).await?;
        parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::MalformedResponse("chat completion without message content".to_string())
            })
    }
}

#[async_trait]
impl EmbeddingService for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.embedding_model,
            "input": texts,
            "dimensions": self.dimensions,
        });
        let parsed = self.post_json("/embeddings", &body).await?;
        parse_embeddings(&parsed, texts.len())
    }
}

#[async_trait]
impl GenerationService for OpenAiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.chat_json(
            &request.system_prompt,
            &request.user_message,
            request.temperature,
            request.max_tokens,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct BoundaryReply {
    #[serde(default)]
    segments: Vec<BoundaryProposal>,
}

#[async_trait]
impl BoundaryDetector for OpenAiClient {
    async fn propose_boundaries(
        &self,
        text: &str,
        page_number: u32,
    ) -> Result<Vec<BoundaryProposal>, ProviderError> {
        let user_message = format!("Page {page_number}\n\n{text}");
        let raw = self
            .chat_json(BOUNDARY_SYSTEM_PROMPT, &user_message, 0.0, 4096)
            .await?;

        let reply: BoundaryReply = serde_json::from_str(strip_code_fences(&raw))
            .map_err(|error| ProviderError::MalformedResponse(format!("boundary reply: {error}")))?;
        Ok(reply.segments)
    }
}

/// Removes a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

fn parse_embeddings(parsed: &Value, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
    let items = parsed
        .pointer("/data")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::MalformedResponse("embedding response without data".to_string()))?;

    let mut indexed = items
        .iter()
        .enumerate()
        .map(|(position, item)| {
            let index = item
                .pointer("/index")
                .and_then(Value::as_u64)
                .map_or(position, |index| index as usize);
            let vector = item
                .pointer("/embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ProviderError::MalformedResponse(format!("embedding {index} has no vector"))
                })?
                .iter()
                .map(|value| value.as_f64().map(|value| value as f32))
                .collect::<Option<Vec<f32>>>()
                .ok_or_else(|| {
                    ProviderError::MalformedResponse(format!("embedding {index} has non-numeric values"))
                })?;
            Ok((index, vector))
        })
        .collect::<Result<Vec<_>, ProviderError>>()?;

    if indexed.len() != expected {
        return Err(ProviderError::MalformedResponse(format!(
            "expected {expected} embeddings, got {}",
            indexed.len()
        )));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

pub(crate) async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let details = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, details))
}

pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    details: String,
) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited {
            retry_after,
            details,
        }
    } else if status.is_server_error() {
        ProviderError::Transient(format!("{status}: {details}"))
    } else {
        ProviderError::Rejected {
            status: status.as_u16(),
            details,
        }
    }
}

pub(crate) fn classify_transport_error(error: reqwest::Error, timeout: Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout)
    } else if error.is_connect() {
        ProviderError::Transient(format!("connection failed: {error}"))
    } else {
        ProviderError::Http(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {\"b\":2} "), "{\"b\":2}");
    }

    #[test]
    fn embeddings_are_reordered_by_index() -> Result<(), Box<dyn std::error::Error>> {
        let parsed = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] },
            ]
        });
        let vectors = parse_embeddings(&parsed, 2)?;
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn embedding_count_mismatch_is_malformed() {
        let parsed = json!({ "data": [ { "index": 0, "embedding": [1.0] } ] });
        assert!(matches!(
            parse_embeddings(&parsed, 2),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn statuses_map_to_error_kinds() {
        let limited = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            "quota".to_string(),
        );
        assert!(limited.is_rate_limited());
        assert!(limited.is_retryable());

        let unavailable = classify_status(StatusCode::BAD_GATEWAY, None, String::new());
        assert!(matches!(unavailable, ProviderError::Transient(_)));

        let rejected = classify_status(StatusCode::UNAUTHORIZED, None, "bad key".to_string());
        assert!(matches!(rejected, ProviderError::Rejected { status: 401, .. }));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn boundary_reply_tolerates_missing_fields() -> Result<(), Box<dyn std::error::Error>> {
        let reply: BoundaryReply =
            serde_json::from_str(r#"{"segments":[{"starts_with":"Customer Success Manager"}]}"#)?;
        assert_eq!(reply.segments.len(), 1);
        assert!(!reply.segments[0].has_table);
        assert!(reply.segments[0].section_title.is_none());
        Ok(())
    }

    #[test]
    fn client_requires_api_key() {
        let settings = ProviderSettings::default();
        assert!(matches!(
            OpenAiClient::new(&settings),
            Err(ProviderError::MissingCredentials(_))
        ));
    }
}
