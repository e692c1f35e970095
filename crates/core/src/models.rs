use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 4] = [
        DocumentStatus::Pending,
        DocumentStatus::Processing,
        DocumentStatus::Completed,
        DocumentStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

/// One indexed source file.
///
/// Status only moves along `pending -> processing -> completed | failed`, plus the
/// forced restart `completed | failed -> pending`. `chunk_count` is only set on
/// the transition to `completed`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub file_path: String,
    pub page_count: u32,
    pub content_hash: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub chunk_count: Option<u32>,
    pub indexed_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        file_path: impl Into<String>,
        page_count: u32,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            file_path: file_path.into(),
            page_count: page_count.max(1),
            content_hash: content_hash.into(),
            status: DocumentStatus::Pending,
            error_message: None,
            chunk_count: None,
            indexed_at: Utc::now(),
        }
    }

    pub fn mark_processing(&mut self) -> Result<(), IngestError> {
        self.transition(DocumentStatus::Processing)
    }

    pub fn mark_completed(&mut self, chunk_count: u32) -> Result<(), IngestError> {
        self.transition(DocumentStatus::Completed)?;
        self.chunk_count = Some(chunk_count);
        self.error_message = None;
        self.indexed_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<(), IngestError> {
        self.transition(DocumentStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Forced reindex: back to `pending` with fresh file facts.
    pub fn restart(&mut self, page_count: u32, content_hash: impl Into<String>) -> Result<(), IngestError> {
        self.transition(DocumentStatus::Pending)?;
        self.page_count = page_count.max(1);
        self.content_hash = content_hash.into();
        self.chunk_count = None;
        self.error_message = None;
        Ok(())
    }

    fn transition(&mut self, to: DocumentStatus) -> Result<(), IngestError> {
        use DocumentStatus::*;

        let allowed = matches!(
            (self.status, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Pending)
                | (Failed, Pending)
        );

        if !allowed {
            return Err(IngestError::InvalidTransition {
                document_id: self.id.clone(),
                from: self.status,
                to,
            });
        }

        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    #[default]
    Text,
    Table,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChunkMetadata {
    pub has_table: bool,
    pub section_title: Option<String>,
    pub extraction_method: ExtractionMethod,
    /// Byte offsets in the content where a later page begins, in ascending order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub page_breaks: Vec<PageBreak>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageBreak {
    pub page: u32,
    pub offset: usize,
}

/// A chunk as produced by the chunker, before it has an identity or an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub content: String,
    pub start_page: u32,
    pub end_page: Option<u32>,
    pub chunk_index: u32,
    pub metadata: ChunkMetadata,
}

/// A persisted, searchable chunk. Its embedding lives in the vector index next to it.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PdfChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub content: String,
    pub page_start: u32,
    pub page_end: Option<u32>,
    pub chunk_index: u32,
    pub metadata: ChunkMetadata,
}

impl PdfChunk {
    /// Page holding the content byte at `offset`.
    pub fn page_at(&self, offset: usize) -> u32 {
        self.metadata
            .page_breaks
            .iter()
            .rev()
            .find(|page_break| page_break.offset <= offset)
            .map_or(self.page_start, |page_break| page_break.page)
    }
}

/// Ephemeral query value.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub asked_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            asked_at: Utc::now(),
            embedding: None,
        }
    }
}

/// A chunk moving through the query path. `similarity` drives the first-stage cut,
/// `rerank_score` is the canonical ordering once reranking has run.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: PdfChunk,
    pub similarity: f64,
    pub rerank_score: Option<f64>,
}

impl Candidate {
    pub fn new(chunk: PdfChunk, similarity: f64) -> Self {
        Self {
            chunk,
            similarity,
            rerank_score: None,
        }
    }

    pub fn relevance(&self) -> f64 {
        self.rerank_score.unwrap_or(self.similarity).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub document_name: String,
    pub page_number: u32,
    pub verbatim_quote: String,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResponseMetadata {
    pub chunks_retrieved: usize,
    pub chunks_used: usize,
    pub processing_time_ms: u64,
    pub confidence_score: f64,
    pub quotes_verified: usize,
}

pub const NOT_FOUND_ANSWER: &str = "No relevant information found in the indexed documents.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub query: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub not_found: bool,
    pub metadata: ResponseMetadata,
}

impl Response {
    pub fn not_found(query: impl Into<String>, chunks_retrieved: usize, processing_time_ms: u64) -> Self {
        Self {
            query: query.into(),
            answer: NOT_FOUND_ANSWER.to_string(),
            citations: Vec::new(),
            not_found: true,
            metadata: ResponseMetadata {
                chunks_retrieved,
                chunks_used: 0,
                processing_time_ms,
                confidence_score: 0.0,
                quotes_verified: 0,
            },
        }
    }

    pub fn render_text(&self, include_quotes: bool) -> String {
        const QUOTE_PREVIEW_CHARS: usize = 200;

        let mut lines = vec![format!("Query: {}", self.query), String::new()];

        if self.not_found {
            lines.push(NOT_FOUND_ANSWER.to_string());
            lines.push(String::new());
            lines.push("This query may be outside the scope of the indexed content.".to_string());
        } else {
            lines.push("Answer:".to_string());
            lines.push(self.answer.clone());
            lines.push(String::new());

            if !self.citations.is_empty() {
                lines.push("Sources:".to_string());
                for (index, citation) in self.citations.iter().enumerate() {
                    lines.push(format!(
                        "{}. {} (page {})",
                        index + 1,
                        citation.document_name,
                        citation.page_number
                    ));
                    if include_quotes && !citation.verbatim_quote.is_empty() {
                        let mut quote: String =
                            citation.verbatim_quote.chars().take(QUOTE_PREVIEW_CHARS).collect();
                        if citation.verbatim_quote.chars().count() > QUOTE_PREVIEW_CHARS {
                            quote.push_str("...");
                        }
                        lines.push(format!("   \"{quote}\""));
                    }
                    lines.push(String::new());
                }
            }
        }

        let mut footer = vec![
            format!("Retrieved {} chunks", self.metadata.chunks_retrieved),
            format!("Used {} sources", self.metadata.chunks_used),
        ];
        if self.metadata.confidence_score > 0.0 {
            footer.push(format!(
                "Confidence: {}%",
                (self.metadata.confidence_score * 100.0).round() as u32
            ));
        }
        footer.push(format!(
            "Response time: {:.1}s",
            self.metadata.processing_time_ms as f64 / 1000.0
        ));

        lines.push("---".to_string());
        lines.push(footer.join(" | "));
        lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Encrypted,
    Unreadable(String),
    NoExtractableText,
    AlreadyIndexed,
    DuplicateContent { original: String },
    PreviouslyFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypted => f.write_str("Encrypted"),
            Self::Unreadable(details) => write!(f, "Unreadable: {details}"),
            Self::NoExtractableText => f.write_str("NoExtractableText"),
            Self::AlreadyIndexed => f.write_str("AlreadyIndexed (use --force to reindex)"),
            Self::DuplicateContent { original } => write!(f, "DuplicateContent of {original}"),
            Self::PreviouslyFailed(details) => {
                write!(f, "PreviouslyFailed: {details} (use --force to retry)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Indexed { chunks: u32 },
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub path: PathBuf,
    pub document_id: Option<String>,
    pub kind: OutcomeKind,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub recursive: bool,
    pub force: bool,
    pub workers: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            force: false,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub min_usable: usize,
    pub widen_factor: usize,
    pub entity_widen_factor: usize,
    pub max_sources: usize,
    pub max_chunks_per_document: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 30,
            min_usable: 5,
            widen_factor: 3,
            entity_widen_factor: 3,
            max_sources: 5,
            max_chunks_per_document: 3,
        }
    }
}
