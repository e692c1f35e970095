use crate::error::IngestError;
use crate::extractor::PageText;
use crate::models::{ChunkDraft, ChunkMetadata, Document, ExtractionMethod, PageBreak, PdfChunk};
use crate::text::{estimate_tokens, locate_normalized};
use crate::traits::{BoundaryDetector, BoundaryProposal};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

const PIECE_SEPARATOR: &str = "\n\n";
const SPLIT_SEPARATORS: [&str; 3] = ["\n\n", "\n", ". "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Hard ceiling per chunk, in estimated tokens.
    pub max_tokens: usize,
    /// Floor per chunk, in characters.
    pub min_chars: usize,
    pub chars_per_token: usize,
    /// Pages longer than this skip boundary detection.
    pub max_detector_input_chars: usize,
    /// Packing target for the paragraph fallback.
    pub fallback_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2000,
            min_chars: 50,
            chars_per_token: 4,
            max_detector_input_chars: 12_000,
            fallback_chars: 2000,
        }
    }
}

impl ChunkingConfig {
    pub fn max_chars(&self) -> usize {
        self.max_tokens.saturating_mul(self.chars_per_token)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_tokens == 0 || self.chars_per_token == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_tokens and chars_per_token must be > 0".to_string(),
            ));
        }
        if self.min_chars >= self.max_chars() {
            return Err(IngestError::InvalidChunkConfig(format!(
                "min_chars {} must be below the ceiling of {} chars",
                self.min_chars,
                self.max_chars()
            )));
        }
        Ok(())
    }
}

/// A contiguous run of page text the chunker treats as one semantic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub text: String,
    pub page: u32,
    pub kind: ExtractionMethod,
    pub section_title: Option<String>,
}

impl Segment {
    pub fn text(page: u32, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page,
            kind: ExtractionMethod::Text,
            section_title: None,
        }
    }

    pub fn table(page: u32, table: &str) -> Self {
        Self {
            text: format!("[Table]\n{}\n[/Table]", table.trim()),
            page,
            kind: ExtractionMethod::Table,
            section_title: None,
        }
    }
}

pub struct SemanticChunker {
    detector: Option<Arc<dyn BoundaryDetector>>,
    config: ChunkingConfig,
}

impl SemanticChunker {
    /// Chunker using only the paragraph policy.
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            detector: None,
            config,
        }
    }

    pub fn with_detector(config: ChunkingConfig, detector: Arc<dyn BoundaryDetector>) -> Self {
        Self {
            detector: Some(detector),
            config,
        }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub async fn chunk_document(&self, pages: &[PageText]) -> Vec<ChunkDraft> {
        let mut segments = Vec::new();
        for page in pages {
            segments.extend(self.segment_page(page).await);
        }
        assemble_chunks(segments, &self.config)
    }

    async fn segment_page(&self, page: &PageText) -> Vec<Segment> {
        let text = page.text.trim();
        let mut segments = Vec::new();

        if !text.is_empty() {
            let proposed = match &self.detector {
                Some(detector) if text.chars().count() <= self.config.max_detector_input_chars => {
                    match detector.propose_boundaries(text, page.number).await {
                        Ok(proposals) => segments_from_proposals(text, page.number, &proposals),
                        Err(error) => {
                            warn!(page = page.number, error = %error, "boundary detection failed, using paragraph fallback");
                            Vec::new()
                        }
                    }
                }
                _ => Vec::new(),
            };

            if proposed.is_empty() {
                segments.extend(
                    pack_paragraphs(text, self.config.fallback_chars)
                        .into_iter()
                        .map(|packed| Segment::text(page.number, packed)),
                );
            } else {
                segments.extend(proposed);
            }
        }

        segments.extend(
            page.tables
                .iter()
                .filter(|table| !table.trim().is_empty())
                .map(|table| Segment::table(page.number, table)),
        );
        segments
    }
}

/// Turns detector proposals into segments of `text`. Proposals that cannot be
/// located are dropped; when two land on the same offset the earlier one wins.
pub fn segments_from_proposals(text: &str, page: u32, proposals: &[BoundaryProposal]) -> Vec<Segment> {
    let mut breaks: Vec<(usize, &BoundaryProposal)> = Vec::new();
    let mut cursor = 0;

    for proposal in proposals {
        let located = locate_normalized(&text[cursor..], &proposal.starts_with)
            .map(|range| cursor + range.start)
            .or_else(|| locate_normalized(text, &proposal.starts_with).map(|range| range.start));

        match located {
            Some(offset) => {
                cursor = offset;
                breaks.push((offset, proposal));
            }
            None => debug!(page, starts_with = %proposal.starts_with, "discarded unlocatable boundary"),
        }
    }

    if breaks.is_empty() {
        return Vec::new();
    }

    breaks.sort_by_key(|(offset, _)| *offset);
    breaks.dedup_by_key(|(offset, _)| *offset);

    let mut segments = Vec::new();
    let leading = text[..breaks[0].0].trim();
    if !leading.is_empty() {
        segments.push(Segment::text(page, leading));
    }

    for (position, (start, proposal)) in breaks.iter().enumerate() {
        let end = breaks
            .get(position + 1)
            .map_or(text.len(), |(next, _)| *next);
        let body = text[*start..end].trim();
        if body.is_empty() {
            continue;
        }
        segments.push(Segment {
            text: body.to_string(),
            page,
            kind: if proposal.has_table {
                ExtractionMethod::Table
            } else {
                ExtractionMethod::Text
            },
            section_title: proposal
                .section_title
                .as_deref()
                .map(str::trim)
                .filter(|title| !title.is_empty())
                .map(str::to_string),
        });
    }

    segments
}

/// Paragraph-aligned packing used when no boundary proposals are available.
pub fn pack_paragraphs(text: &str, target_chars: usize) -> Vec<String> {
    let paragraphs = text
        .split(PIECE_SEPARATOR)
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty());

    let mut packed = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs {
        if current.is_empty() {
            current.push_str(paragraph);
            continue;
        }

        if char_len(&current) + PIECE_SEPARATOR.len() + char_len(paragraph) <= target_chars {
            current.push_str(PIECE_SEPARATOR);
            current.push_str(paragraph);
        } else {
            packed.push(std::mem::take(&mut current));
            current.push_str(paragraph);
        }
    }

    if !current.is_empty() {
        packed.push(current);
    }
    packed
}

#[derive(Debug)]
struct PendingChunk {
    text: String,
    start_page: u32,
    end_page: u32,
    text_chars: usize,
    table_chars: usize,
    section_title: Option<String>,
    page_breaks: Vec<PageBreak>,
}

impl PendingChunk {
    fn new(text: String, segment: &Segment) -> Self {
        let chars = char_len(&text);
        let (text_chars, table_chars) = match segment.kind {
            ExtractionMethod::Text => (chars, 0),
            ExtractionMethod::Table => (0, chars),
        };
        Self {
            text,
            start_page: segment.page,
            end_page: segment.page,
            text_chars,
            table_chars,
            section_title: segment.section_title.clone(),
            page_breaks: Vec::new(),
        }
    }

    fn chars(&self) -> usize {
        char_len(&self.text)
    }

    fn fits_with(&self, other: &PendingChunk, max_chars: usize) -> bool {
        self.chars() + PIECE_SEPARATOR.len() + other.chars() <= max_chars
    }

    fn absorb(&mut self, other: PendingChunk) {
        let offset = self.text.len() + PIECE_SEPARATOR.len();
        if other.start_page > self.end_page {
            self.page_breaks.push(PageBreak {
                page: other.start_page,
                offset,
            });
        }
        self.page_breaks
            .extend(other.page_breaks.iter().map(|page_break| PageBreak {
                page: page_break.page,
                offset: page_break.offset + offset,
            }));

        self.text.push_str(PIECE_SEPARATOR);
        self.text.push_str(&other.text);
        self.start_page = self.start_page.min(other.start_page);
        self.end_page = self.end_page.max(other.end_page);
        self.text_chars += other.text_chars;
        self.table_chars += other.table_chars;
        if self.section_title.is_none() {
            self.section_title = other.section_title;
        }
    }

    fn into_draft(self, chunk_index: u32) -> ChunkDraft {
        let extraction_method = if self.table_chars > self.text_chars {
            ExtractionMethod::Table
        } else {
            ExtractionMethod::Text
        };
        ChunkDraft {
            content: self.text,
            start_page: self.start_page,
            end_page: (self.end_page > self.start_page).then_some(self.end_page),
            chunk_index,
            metadata: ChunkMetadata {
                has_table: self.table_chars > 0,
                section_title: self.section_title,
                extraction_method,
                page_breaks: self.page_breaks,
            },
        }
    }
}

/// Applies the size ceiling and floor to ordered segments.
///
/// Oversized segments are split at the nearest paragraph, line or sentence break
/// (hard character windows as a last resort). A piece under the floor is merged
/// into the previous chunk, or carried into the next one; if neither fits under
/// the ceiling it is dropped.
pub fn assemble_chunks(segments: Vec<Segment>, config: &ChunkingConfig) -> Vec<ChunkDraft> {
    let max_chars = config.max_chars();
    let mut built: Vec<PendingChunk> = Vec::new();
    let mut carry: Option<PendingChunk> = None;

    let pieces = segments.iter().flat_map(|segment| {
        split_oversized(&segment.text, max_chars)
            .into_iter()
            .map(move |text| PendingChunk::new(text, segment))
    });

    for piece in pieces {
        let mut current = piece;

        if let Some(short) = carry.take() {
            if short.fits_with(&current, max_chars) {
                let mut merged = short;
                merged.absorb(current);
                current = merged;
            } else {
                drop_fragment(&short);
            }
        }

        if current.chars() >= config.min_chars {
            built.push(current);
            continue;
        }

        match built.last_mut() {
            Some(previous) if previous.fits_with(&current, max_chars) => previous.absorb(current),
            _ => carry = Some(current),
        }
    }

    if let Some(short) = carry {
        match built.last_mut() {
            Some(previous) if previous.fits_with(&short, max_chars) => previous.absorb(short),
            _ => drop_fragment(&short),
        }
    }

    built
        .into_iter()
        .enumerate()
        .map(|(index, pending)| pending.into_draft(index as u32))
        .collect()
}

fn drop_fragment(fragment: &PendingChunk) {
    warn!(
        page = fragment.start_page,
        chars = fragment.chars(),
        "dropped short fragment that fits no neighbouring chunk"
    );
}

pub fn split_oversized(text: &str, max_chars: usize) -> Vec<String> {
    split_with(text.trim(), max_chars.max(1), &SPLIT_SEPARATORS)
}

fn split_with(text: &str, max_chars: usize, separators: &[&str]) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let Some((separator, finer)) = separators.split_first() else {
        return hard_windows(text, max_chars);
    };

    let parts: Vec<&str> = text.split_inclusive(*separator).collect();
    if parts.len() <= 1 {
        return split_with(text, max_chars, finer);
    }

    let mut pieces = Vec::new();
    let mut current = String::new();

    for part in parts {
        if char_len(&current) + char_len(part) <= max_chars {
            current.push_str(part);
            continue;
        }

        flush_piece(&mut current, &mut pieces);
        if char_len(part) > max_chars {
            pieces.extend(split_with(part.trim(), max_chars, finer));
        } else {
            current.push_str(part);
        }
    }
    flush_piece(&mut current, &mut pieces);
    pieces
}

fn flush_piece(current: &mut String, pieces: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        pieces.push(trimmed.to_string());
    }
    current.clear();
}

fn hard_windows(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|window| window.iter().collect::<String>().trim().to_string())
        .filter(|window| !window.is_empty())
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub fn token_estimate(text: &str, config: &ChunkingConfig) -> usize {
    estimate_tokens(text, config.chars_per_token)
}

/// Gives drafts their identity and owning document.
pub fn build_chunks(document: &Document, drafts: Vec<ChunkDraft>) -> Vec<PdfChunk> {
    drafts
        .into_iter()
        .map(|draft| PdfChunk {
            chunk_id: make_chunk_id(&document.id, draft.start_page, draft.chunk_index, &draft.content),
            document_id: document.id.clone(),
            document_name: document.name.clone(),
            content: draft.content,
            page_start: draft.start_page,
            page_end: draft.end_page,
            chunk_index: draft.chunk_index,
            metadata: draft.metadata,
        })
        .collect()
}

pub fn make_chunk_id(document_id: &str, page: u32, index: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
