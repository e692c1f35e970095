use crate::citation::{check_citations, parse_generation, referenced_sources};
use crate::error::SearchError;
use crate::models::{Candidate, Citation, Response, ResponseMetadata};
use crate::providers::{with_backoff, RetryPolicy};
use crate::text::extract_best_quote;
use crate::traits::{GenerationRequest, GenerationService};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

const QUOTE_MAX_CHARS: usize = 200;
const FALLBACK_CITATIONS: usize = 3;
const MAX_ANSWER_TOKENS: u32 = 4096;

const ENTITY_QUERY_PATTERNS: [&str; 10] = [
    r"^who\s+(are|is|were|was)\s+",
    r"^what\s+(are|is|were|was)\s+all\s+",
    r"^what\s+(are|is)\s+the\s+\w+s\b",
    r"^list\s+(all\s+)?(the\s+)?",
    r"^name\s+(all\s+)?(the\s+)?",
    r"^which\s+\w+s\s+(are|were|have|had)",
    r"^how\s+many\s+",
    r"^give\s+me\s+(a\s+)?list\s+",
    r"^enumerate\s+",
    r"^identify\s+(all\s+)?(the\s+)?",
];

const ANSWER_SYSTEM_PROMPT: &str = r#"You are a precise document question-answering assistant.

Answer the question using ONLY the numbered sources provided. Every statement in your answer must be supported by a source.

RULES:
1. Never use outside knowledge. If the sources do not contain the answer, set "not_found" to true.
2. Cite the supporting source inline with [Source N] after each statement.
3. Every citation must carry a "verbatim_quote" copied exactly, word for word, from that source. Do not paraphrase quotes.
4. Keep quotes short: the sentence or phrase that supports the statement.
5. When several sources support the answer, cite each of them.

Output format: Return a JSON object with:
- "answer": your answer with inline [Source N] references
- "citations": array of objects with "source_index" (1-based) and "verbatim_quote"
- "not_found": true if the sources don't contain relevant information, otherwise false"#;

const AGGREGATION_SYSTEM_PROMPT: &str = r#"You are a precise document question-answering assistant specializing in aggregating information from multiple sources.

Your task is to compile a COMPLETE list or answer by synthesizing information from ALL provided sources.

CRITICAL RULES:
1. AGGREGATE information from ALL sources, do not limit the answer to one source
2. For each item in your list, cite the specific source(s) where it was found using [Source N]
3. If the same item appears in multiple sources, list it once but cite all of its sources
4. ONLY include information actually present in the sources, never fabricate
5. Every citation must carry a "verbatim_quote" copied exactly from that source
6. Format lists clearly with each item on its own line

Output format: Return a JSON object with:
- "answer": your complete aggregated answer with inline citations [Source N] for each item
- "citations": array of objects with "source_index" (1-based) and "verbatim_quote" (exact text supporting an item)
- "not_found": true if the sources don't contain relevant information

Example for "Who are the managers?":
{
  "answer": "The managers are:\n\n1. John Smith - Regional Manager [Source 1]\n2. Jane Doe - Department Manager [Source 1, Source 2]",
  "citations": [
    {"source_index": 1, "verbatim_quote": "John Smith serves as Regional Manager"},
    {"source_index": 1, "verbatim_quote": "Jane Doe is the Department Manager"},
    {"source_index": 2, "verbatim_quote": "Jane Doe manages the engineering department"}
  ],
  "not_found": false
}"#;

/// List and entity style questions ("who are...", "list all...", "how many...").
pub fn is_entity_query(query: &str) -> bool {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        ENTITY_QUERY_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    });

    let query = query.trim().to_lowercase();
    patterns.iter().any(|pattern| pattern.is_match(&query))
}

/// Picks up to `max_sources` candidates from a ranked list: first the best
/// candidate of every contributing document, then the remaining slots by rank
/// with at most `max_per_document` per document. The result keeps rank order.
pub fn select_sources(ranked: &[Candidate], max_sources: usize, max_per_document: usize) -> Vec<Candidate> {
    let max_per_document = max_per_document.max(1);
    let mut per_document: HashMap<&str, usize> = HashMap::new();
    let mut picked = Vec::new();

    for (position, candidate) in ranked.iter().enumerate() {
        if picked.len() >= max_sources {
            break;
        }
        let document = candidate.chunk.document_id.as_str();
        if !per_document.contains_key(document) {
            per_document.insert(document, 1);
            picked.push(position);
        }
    }

    for (position, candidate) in ranked.iter().enumerate() {
        if picked.len() >= max_sources {
            break;
        }
        if picked.contains(&position) {
            continue;
        }
        let count = per_document.entry(candidate.chunk.document_id.as_str()).or_insert(0);
        if *count < max_per_document {
            *count += 1;
            picked.push(position);
        }
    }

    picked.sort_unstable();
    picked.into_iter().map(|position| ranked[position].clone()).collect()
}

pub fn build_request(query: &str, sources: &[Candidate], aggregate: bool) -> GenerationRequest {
    let context = sources
        .iter()
        .enumerate()
        .map(|(position, source)| {
            format!(
                "[Source {}: {}, page {}]\n{}\n",
                position + 1,
                source.chunk.document_name,
                source.chunk.page_start,
                source.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n");

    let (system_prompt, instruction) = if aggregate {
        (
            AGGREGATION_SYSTEM_PROMPT,
            "Compile a COMPLETE answer by aggregating information from ALL sources. For list queries, include ALL matching items found across all documents. Return ONLY the JSON object.",
        )
    } else {
        (
            ANSWER_SYSTEM_PROMPT,
            "Answer using only these sources. Return ONLY the JSON object.",
        )
    };

    GenerationRequest {
        system_prompt: system_prompt.to_string(),
        user_message: format!("Question: {query}\n\nSources:\n{context}\n\n{instruction}"),
        temperature: 0.0,
        max_tokens: MAX_ANSWER_TOKENS,
    }
}

/// Mean citation relevance, plus 0.02 per citation (at most 0.1), minus half the
/// variance (at most 0.1). Clamped to `[0, 1]` and rounded to two decimals.
pub fn confidence_score(scores: &[f64]) -> f64 {
    let scores = scores.iter().copied().filter(|score| *score > 0.0).collect::<Vec<_>>();
    if scores.is_empty() {
        return 0.0;
    }

    let count = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / count;
    let bonus = (count * 0.02).min(0.1);
    let penalty = if scores.len() > 1 {
        let variance = scores.iter().map(|score| (score - mean).powi(2)).sum::<f64>() / count;
        (variance * 0.5).min(0.1)
    } else {
        0.0
    };

    ((mean + bonus - penalty) * 100.0).round().clamp(0.0, 100.0) / 100.0
}

/// Turns reranked candidates into a grounded [`Response`].
pub struct AnswerSynthesizer {
    generator: Arc<dyn GenerationService>,
    policy: RetryPolicy,
    max_chunks_per_document: usize,
}

impl AnswerSynthesizer {
    pub fn new(generator: Arc<dyn GenerationService>, policy: RetryPolicy, max_chunks_per_document: usize) -> Self {
        Self {
            generator,
            policy,
            max_chunks_per_document,
        }
    }

    /// `chunks_retrieved` and `processing_time_ms` are left for the caller,
    /// which sees the whole query path.
    pub async fn synthesize(
        &self,
        query: &str,
        ranked: &[Candidate],
        max_sources: usize,
    ) -> Result<Response, SearchError> {
        let sources = select_sources(ranked, max_sources, self.max_chunks_per_document);
        if sources.is_empty() {
            debug!("no candidate above the relevance floor");
            return Ok(Response::not_found(query, ranked.len(), 0));
        }

        let aggregate = is_entity_query(query);
        let request = build_request(query, &sources, aggregate);
        let generator = &self.generator;
        let request = &request;
        let raw = with_backoff(&self.policy, "generate", move || generator.generate(request))
            .await
            .map_err(SearchError::GenerationUnavailable)?;

        let output = parse_generation(&raw);
        if output.not_found {
            info!("model reported no grounding in sources");
            return Ok(Response::not_found(query, ranked.len(), 0));
        }

        let contents = sources
            .iter()
            .map(|source| source.chunk.content.as_str())
            .collect::<Vec<_>>();
        let check = check_citations(&output.citations, &contents);
        for (claim, reason) in &check.rejected {
            debug!(
                source_index = claim.source_index,
                quote = %claim.verbatim_quote,
                reason = %reason,
                "dropped citation"
            );
        }

        let quotes_verified = check.accepted.len();
        let mut cited = check
            .accepted
            .into_iter()
            .map(|verified| (verified.source, verified.quote))
            .collect::<Vec<_>>();

        let mut cited_documents = cited
            .iter()
            .map(|(source, _)| sources[*source].chunk.document_id.clone())
            .collect::<HashSet<_>>();
        for source in referenced_sources(&output.answer) {
            let Some(candidate) = sources.get(source) else {
                continue;
            };
            if cited_documents.insert(candidate.chunk.document_id.clone()) {
                let quote = extract_best_quote(&candidate.chunk.content, QUOTE_MAX_CHARS);
                if !quote.is_empty() {
                    cited.push((source, quote));
                }
            }
        }

        if cited.is_empty() {
            for (source, candidate) in sources.iter().enumerate().take(FALLBACK_CITATIONS) {
                let quote = extract_best_quote(&candidate.chunk.content, QUOTE_MAX_CHARS);
                if !quote.is_empty() {
                    cited.push((source, quote));
                }
            }
        }

        let citations = cited
            .into_iter()
            .map(|(source, quote)| {
                let chunk = &sources[source].chunk;
                let page_number = chunk
                    .content
                    .find(quote.as_str())
                    .map_or(chunk.page_start, |offset| chunk.page_at(offset));
                Citation {
                    document_name: chunk.document_name.clone(),
                    page_number,
                    verbatim_quote: quote,
                    relevance_score: sources[source].relevance(),
                }
            })
            .collect::<Vec<_>>();

        let scores = citations.iter().map(|citation| citation.relevance_score).collect::<Vec<_>>();
        Ok(Response {
            query: query.to_string(),
            answer: output.answer,
            not_found: false,
            metadata: ResponseMetadata {
                chunks_retrieved: ranked.len(),
                chunks_used: citations.len(),
                processing_time_ms: 0,
                confidence_score: confidence_score(&scores),
                quotes_verified,
            },
            citations,
        })
    }
}
