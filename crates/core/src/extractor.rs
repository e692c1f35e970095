use crate::error::IngestError;
use lopdf::Document;
use std::path::Path;
use tracing::{debug, warn};

/// Text of one page. `tables` holds table-like blocks lifted out of `text`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageText {
    pub number: u32,
    pub text: String,
    pub tables: Vec<String>,
}

impl PageText {
    pub fn new(number: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            text: text.into(),
            tables: Vec::new(),
        }
    }

    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty() || self.tables.iter().any(|table| !table.trim().is_empty())
    }
}

/// Blocking PDF access. Callers run it on a blocking thread.
pub trait PdfExtractor: Send + Sync {
    /// Checks that the file opens and is not encrypted; returns its page count.
    fn probe(&self, path: &Path) -> Result<u32, IngestError>;

    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl LopdfExtractor {
    fn load(&self, path: &Path) -> Result<Document, IngestError> {
        let document = Document::load(path).map_err(|error| classify_load_error(path, &error.to_string()))?;

        if document.is_encrypted() {
            return Err(IngestError::Encrypted {
                path: path.display().to_string(),
            });
        }

        if document.get_pages().is_empty() {
            return Err(IngestError::Unreadable {
                path: path.display().to_string(),
                details: "pdf has no pages".to_string(),
            });
        }

        Ok(document)
    }
}

impl PdfExtractor for LopdfExtractor {
    fn probe(&self, path: &Path) -> Result<u32, IngestError> {
        let document = self.load(path)?;
        Ok(document.get_pages().len() as u32)
    }

    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document = self.load(path)?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let raw = match document.extract_text(&[page_no]) {
                Ok(text) => text,
                Err(error) => {
                    warn!(path = %path.display(), page = page_no, error = %error, "page text extraction failed");
                    String::new()
                }
            };

            let (text, tables) = split_tables(&raw);
            debug!(path = %path.display(), page = page_no, chars = text.len(), tables = tables.len(), "extracted page");
            pages.push(PageText {
                number: page_no,
                text,
                tables,
            });
        }

        Ok(pages)
    }
}

fn classify_load_error(path: &Path, details: &str) -> IngestError {
    let lowered = details.to_lowercase();
    if lowered.contains("encrypt") || lowered.contains("decrypt") || lowered.contains("password") {
        IngestError::Encrypted {
            path: path.display().to_string(),
        }
    } else {
        IngestError::Unreadable {
            path: path.display().to_string(),
            details: details.to_string(),
        }
    }
}

const MIN_TABLE_ROWS: usize = 3;

/// Lifts runs of column-aligned lines out of page text. A run needs at least
/// three consecutive rows with two or more cells each.
pub fn split_tables(raw: &str) -> (String, Vec<String>) {
    let mut prose = Vec::new();
    let mut tables = Vec::new();
    let mut run: Vec<&str> = Vec::new();

    fn flush(run: &mut Vec<&str>, prose: &mut Vec<String>, tables: &mut Vec<String>) {
        if run.len() >= MIN_TABLE_ROWS {
            tables.push(run.join("\n"));
        } else {
            prose.extend(run.iter().map(|line| line.to_string()));
        }
        run.clear();
    }

    for line in raw.lines() {
        if cell_count(line) >= 2 {
            run.push(line.trim_end());
        } else {
            flush(&mut run, &mut prose, &mut tables);
            prose.push(line.to_string());
        }
    }
    flush(&mut run, &mut prose, &mut tables);

    (prose.join("\n").trim().to_string(), tables)
}

fn cell_count(line: &str) -> usize {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return 0;
    }
    trimmed
        .split(|ch| ch == '\t' || ch == '|')
        .flat_map(|part| part.split("  "))
        .filter(|cell| !cell.trim().is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn aligned_rows_become_a_table_block() {
        let raw = "Quarterly results\nRegion\tQ1\tQ2\nNorth\t10\t12\nSouth\t8\t9\nTotals follow below.";
        let (text, tables) = split_tables(raw);

        assert_eq!(tables.len(), 1);
        assert!(tables[0].starts_with("Region\tQ1"));
        assert!(text.contains("Quarterly results"));
        assert!(text.contains("Totals follow below."));
        assert!(!text.contains("North"));
    }

    #[test]
    fn short_runs_stay_in_prose() {
        let raw = "Name  Role\nAlice  CSM\nThe rest is prose.";
        let (text, tables) = split_tables(raw);
        assert!(tables.is_empty());
        assert!(text.contains("Alice  CSM"));
    }

    #[test]
    fn garbage_file_is_unreadable() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile()?;
        file.write_all(b"this is not a pdf")?;

        let result = LopdfExtractor.probe(file.path());
        assert!(matches!(result, Err(IngestError::Unreadable { .. })));
        Ok(())
    }

    #[test]
    fn encryption_errors_are_classified() {
        let error = classify_load_error(Path::new("/tmp/a.pdf"), "Decryption error: wrong password");
        assert!(matches!(error, IngestError::Encrypted { .. }));

        let error = classify_load_error(Path::new("/tmp/a.pdf"), "invalid file header");
        assert!(matches!(error, IngestError::Unreadable { .. }));
    }
}
