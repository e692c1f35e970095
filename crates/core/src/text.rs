//! Text helpers shared by chunking and citation validation.
//!
//! Matching is done on a case-folded, whitespace-collapsed view of the text, but
//! every match is mapped back to a byte range of the original string, so callers
//! can always slice a literal substring out of the source.

use std::ops::Range;

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Case-folded, whitespace-collapsed form used for comparisons.
pub fn normalize_for_match(text: &str) -> String {
    NormalizedView::new(text).text
}

pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    text.chars().count().div_ceil(chars_per_token.max(1))
}

/// Finds `needle` in `haystack` ignoring case and whitespace differences and
/// returns the matching byte range of `haystack`.
pub fn locate_normalized(haystack: &str, needle: &str) -> Option<Range<usize>> {
    let needle = normalize_for_match(needle);
    if needle.is_empty() {
        return None;
    }

    let view = NormalizedView::new(haystack);
    let found = view.text.find(&needle)?;
    view.original_range(found, found + needle.len())
}

/// First substantial sentence of `content`, at most `max_chars` long, always a
/// literal substring of `content`.
pub fn extract_best_quote(content: &str, max_chars: usize) -> String {
    const MIN_SENTENCE_CHARS: usize = 50;

    let sentence = content
        .split(". ")
        .map(str::trim)
        .find(|sentence| sentence.chars().count() >= MIN_SENTENCE_CHARS)
        .unwrap_or_else(|| content.trim());

    truncate_chars(sentence, max_chars).trim_end().to_string()
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

struct NormalizedView {
    text: String,
    // (byte offset in `text`, original start, original end) per normalized char
    spans: Vec<(usize, usize, usize)>,
}

impl NormalizedView {
    fn new(source: &str) -> Self {
        let mut text = String::with_capacity(source.len());
        let mut spans = Vec::with_capacity(source.len());
        let mut pending_space: Option<(usize, usize)> = None;

        for (start, ch) in source.char_indices() {
            let end = start + ch.len_utf8();
            if ch.is_whitespace() {
                if !text.is_empty() && pending_space.is_none() {
                    pending_space = Some((start, end));
                }
                continue;
            }

            if let Some((space_start, space_end)) = pending_space.take() {
                spans.push((text.len(), space_start, space_end));
                text.push(' ');
            }

            for lowered in ch.to_lowercase() {
                spans.push((text.len(), start, end));
                text.push(lowered);
            }
        }

        Self { text, spans }
    }

    fn original_range(&self, start: usize, end: usize) -> Option<Range<usize>> {
        let first = self.spans.partition_point(|span| span.0 < start);
        let last = self.spans.partition_point(|span| span.0 < end).checked_sub(1)?;
        let (_, original_start, _) = *self.spans.get(first)?;
        let (_, _, original_end) = *self.spans.get(last)?;
        (original_start < original_end).then_some(original_start..original_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        assert_eq!(normalize_whitespace(input), "A lot of spacing");
    }

    #[test]
    fn locate_ignores_case_and_whitespace() {
        let content = "The Customer Success\n  Manager (CSM) owns renewals.";
        let range = locate_normalized(content, "customer success manager").expect("match");
        assert_eq!(&content[range], "Customer Success\n  Manager");
    }

    #[test]
    fn locate_returns_none_for_absent_text() {
        assert!(locate_normalized("alpha beta", "gamma").is_none());
        assert!(locate_normalized("alpha beta", "   ").is_none());
    }

    #[test]
    fn locate_handles_multibyte_text() {
        let content = "Größe der Anlage: 40 m²";
        let range = locate_normalized(content, "GRÖSSE").map(|r| content[r].to_string());
        // German sharp s does not case-fold to "ss" with simple lowercasing
        assert!(range.is_none());
        let range = locate_normalized(content, "anlage: 40 M²").expect("match");
        assert_eq!(&content[range], "Anlage: 40 m²");
    }

    #[test]
    fn best_quote_is_literal_substring() {
        let content = "Short. This sentence is long enough to be picked as the best quote for a citation. Tail.";
        let quote = extract_best_quote(content, 200);
        assert!(content.contains(&quote));
        assert!(quote.starts_with("This sentence"));
    }

    #[test]
    fn best_quote_truncates_on_char_boundary() {
        let content = "é".repeat(300);
        let quote = extract_best_quote(&content, 10);
        assert_eq!(quote.chars().count(), 10);
        assert!(content.contains(&quote));
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens("abcde", 4), 2);
        assert_eq!(estimate_tokens("abcd", 4), 1);
        assert_eq!(estimate_tokens("", 4), 0);
    }
}
