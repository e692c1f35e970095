//! Parsing and validation of model-claimed citations.
//!
//! Everything here is pure. A claimed quote is only accepted when it can be
//! found in the cited chunk, and the accepted quote is always the literal span
//! cut from the chunk, never the model's own text.

use crate::providers::strip_code_fences;
use crate::text::{locate_normalized, normalize_for_match};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedCitation {
    /// 1-based, as written in the prompt's `[Source N]` labels.
    pub source_index: i64,
    pub verbatim_quote: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationOutput {
    pub answer: String,
    pub citations: Vec<ClaimedCitation>,
    pub not_found: bool,
}

/// Reads `{answer, citations[{source_index, verbatim_quote}], not_found}`.
/// Output that is not a JSON object becomes the answer text.
pub fn parse_generation(raw: &str) -> GenerationOutput {
    let body = strip_code_fences(raw);
    let parsed = match serde_json::from_str::<Value>(body) {
        Ok(value) if value.is_object() => value,
        _ => {
            return GenerationOutput {
                answer: body.to_string(),
                ..GenerationOutput::default()
            }
        }
    };

    let answer = parsed
        .pointer("/answer")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let not_found = parsed
        .pointer("/not_found")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let citations = parsed
        .pointer("/citations")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_claim).collect())
        .unwrap_or_default();

    GenerationOutput {
        answer,
        citations,
        not_found,
    }
}

fn parse_claim(item: &Value) -> Option<ClaimedCitation> {
    let index = item.pointer("/source_index")?;
    let source_index = index
        .as_i64()
        .or_else(|| index.as_str().and_then(|text| text.trim().parse().ok()))?;

    Some(ClaimedCitation {
        source_index,
        verbatim_quote: item
            .pointer("/verbatim_quote")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CitationRejection {
    SourceOutOfRange { source_index: i64, sources: usize },
    EmptyQuote,
    QuoteNotInSource,
    DuplicateQuote,
}

impl fmt::Display for CitationRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceOutOfRange {
                source_index,
                sources,
            } => write!(f, "source {source_index} is outside 1..={sources}"),
            Self::EmptyQuote => f.write_str("empty quote"),
            Self::QuoteNotInSource => f.write_str("quote not found in source"),
            Self::DuplicateQuote => f.write_str("duplicate quote"),
        }
    }
}

/// Literal span of `content` matching `quote`, ignoring case and whitespace.
pub fn validate_quote(quote: &str, content: &str) -> Option<String> {
    let range = locate_normalized(content, quote)?;
    let literal = content.get(range)?.trim();
    (!literal.is_empty()).then(|| literal.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedQuote {
    /// 0-based position in the source list.
    pub source: usize,
    pub quote: String,
}

#[derive(Debug, Default)]
pub struct CitationCheck {
    pub accepted: Vec<VerifiedQuote>,
    pub rejected: Vec<(ClaimedCitation, CitationRejection)>,
}

/// Checks every claim against the numbered `sources`, in claim order.
pub fn check_citations(claims: &[ClaimedCitation], sources: &[&str]) -> CitationCheck {
    let mut check = CitationCheck::default();
    let mut seen = HashSet::new();

    for claim in claims {
        match check_claim(claim, sources, &mut seen) {
            Ok(verified) => check.accepted.push(verified),
            Err(reason) => check.rejected.push((claim.clone(), reason)),
        }
    }
    check
}

fn check_claim(
    claim: &ClaimedCitation,
    sources: &[&str],
    seen: &mut HashSet<(usize, String)>,
) -> Result<VerifiedQuote, CitationRejection> {
    let source = claim
        .source_index
        .checked_sub(1)
        .and_then(|index| usize::try_from(index).ok())
        .filter(|index| *index < sources.len())
        .ok_or(CitationRejection::SourceOutOfRange {
            source_index: claim.source_index,
            sources: sources.len(),
        })?;

    if claim.verbatim_quote.trim().is_empty() {
        return Err(CitationRejection::EmptyQuote);
    }

    let quote = validate_quote(&claim.verbatim_quote, sources[source])
        .ok_or(CitationRejection::QuoteNotInSource)?;

    if !seen.insert((source, normalize_for_match(&quote))) {
        return Err(CitationRejection::DuplicateQuote);
    }

    Ok(VerifiedQuote { source, quote })
}

/// 0-based source positions the answer text refers to as `[Source N]`,
/// including grouped forms such as `[Source 1, Source 3]`.
pub fn referenced_sources(answer: &str) -> BTreeSet<usize> {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    let Some((group, number)) = PATTERNS.get_or_init(|| {
        Some((
            Regex::new(r"(?i)\[\s*sources?\s+([^\]]+)\]").ok()?,
            Regex::new(r"\d+").ok()?,
        ))
    }) else {
        return BTreeSet::new();
    };

    group
        .captures_iter(answer)
        .filter_map(|captures| captures.get(1))
        .flat_map(|inner| number.find_iter(inner.as_str()))
        .filter_map(|found| found.as_str().parse::<usize>().ok())
        .filter_map(|index| index.checked_sub(1))
        .collect()
}
