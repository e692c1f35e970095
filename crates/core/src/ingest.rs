use crate::chunking::{build_chunks, SemanticChunker};
use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::extractor::{PageText, PdfExtractor};
use crate::models::{
    Document, DocumentOutcome, DocumentStatus, IngestionOptions, OutcomeKind, SkipReason,
};
use crate::traits::{DocumentStore, VectorIndex};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(folder);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker.into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_by_cached_key(|path| {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        (name, path.clone())
    });
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn generate_document_id(file_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct IndexingSummary {
    pub total: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_chunks: u64,
    pub elapsed: Duration,
    /// One entry per discovered file, ordered by path.
    pub outcomes: Vec<DocumentOutcome>,
}

impl IndexingSummary {
    fn from_outcomes(outcomes: Vec<DocumentOutcome>, elapsed: Duration) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            indexed: 0,
            skipped: 0,
            failed: 0,
            total_chunks: 0,
            elapsed,
            outcomes: Vec::new(),
        };

        for outcome in &outcomes {
            match &outcome.kind {
                OutcomeKind::Indexed { chunks } => {
                    summary.indexed += 1;
                    summary.total_chunks += u64::from(*chunks);
                }
                OutcomeKind::Skipped(_) => summary.skipped += 1,
                OutcomeKind::Failed(_) => summary.failed += 1,
            }
        }

        summary.outcomes = outcomes;
        summary
    }

    pub fn skipped_files(&self) -> impl Iterator<Item = (&Path, &SkipReason)> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.kind {
            OutcomeKind::Skipped(reason) => Some((outcome.path.as_path(), reason)),
            _ => None,
        })
    }

    pub fn failed_files(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.kind {
            OutcomeKind::Failed(message) => Some((outcome.path.as_path(), message.as_str())),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub documents: Vec<Document>,
    pub indexed_chunks: usize,
}

impl IndexStatus {
    pub fn count(&self, status: DocumentStatus) -> usize {
        self.documents
            .iter()
            .filter(|document| document.status == status)
            .count()
    }
}

/// Drives documents through extraction, chunking, embedding and persistence.
///
/// Each document's chunk set is written with a single `upsert_chunks` call and
/// the document only turns `completed` after that write succeeded. On any
/// failure its chunks are removed again before it is marked `failed`.
pub struct Indexer<V: VectorIndex + ?Sized, D: DocumentStore + ?Sized> {
    vectors: Arc<V>,
    documents: Arc<D>,
    extractor: Arc<dyn PdfExtractor>,
    chunker: SemanticChunker,
    embedder: Embedder,
}

impl<V, D> Indexer<V, D>
where
    V: VectorIndex + ?Sized,
    D: DocumentStore + ?Sized,
{
    pub fn new(
        vectors: Arc<V>,
        documents: Arc<D>,
        extractor: Arc<dyn PdfExtractor>,
        chunker: SemanticChunker,
        embedder: Embedder,
    ) -> Result<Self, IngestError> {
        chunker.config().validate()?;
        if vectors.dimensions() != embedder.dimensions() {
            return Err(IngestError::InvalidArgument(format!(
                "embedding width {} does not match vector index width {}",
                embedder.dimensions(),
                vectors.dimensions()
            )));
        }

        Ok(Self {
            vectors,
            documents,
            extractor,
            chunker,
            embedder,
        })
    }

    pub async fn index_folder(
        &self,
        folder: &Path,
        options: &IngestionOptions,
    ) -> Result<IndexingSummary, IngestError> {
        let started = Instant::now();

        if !folder.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "not a directory: {}",
                folder.display()
            )));
        }

        let files = discover_pdf_files(folder, options.recursive);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }
        info!(folder = %folder.display(), files = files.len(), workers = options.workers, "indexing folder");

        let mut outcomes = Vec::with_capacity(files.len());
        let mut first_seen: HashMap<String, PathBuf> = HashMap::new();
        let mut jobs = Vec::new();

        for path in files {
            let hash_path = path.clone();
            let digest = tokio::task::spawn_blocking(move || digest_file(&hash_path))
                .await
                .map_err(|error| IngestError::Task(error.to_string()))
                .and_then(|result| result);

            match digest {
                Ok(hash) => match first_seen.get(&hash) {
                    Some(original) => {
                        let reason = SkipReason::DuplicateContent {
                            original: display_name(original),
                        };
                        warn!(path = %path.display(), reason = %reason, "skipped pdf");
                        outcomes.push(DocumentOutcome {
                            path,
                            document_id: None,
                            kind: OutcomeKind::Skipped(reason),
                        });
                    }
                    None => {
                        first_seen.insert(hash.clone(), path.clone());
                        jobs.push((path, hash));
                    }
                },
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "failed to hash pdf");
                    outcomes.push(DocumentOutcome {
                        path,
                        document_id: None,
                        kind: OutcomeKind::Failed(error.to_string()),
                    });
                }
            }
        }

        let processed = stream::iter(jobs)
            .map(|(path, hash)| self.index_file(path, hash, options.force))
            .buffer_unordered(options.workers.max(1))
            .collect::<Vec<_>>()
            .await;
        outcomes.extend(processed);
        outcomes.sort_by(|left, right| left.path.cmp(&right.path));

        let summary = IndexingSummary::from_outcomes(outcomes, started.elapsed());
        info!(
            indexed = summary.indexed,
            skipped = summary.skipped,
            failed = summary.failed,
            chunks = summary.total_chunks,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "indexing finished"
        );
        Ok(summary)
    }

    async fn index_file(&self, path: PathBuf, hash: String, force: bool) -> DocumentOutcome {
        let file_path = absolute_path(&path);
        let document_id = generate_document_id(&file_path);

        let kind = match self.try_index_file(&path, &file_path, &document_id, &hash, force).await {
            Ok(kind) => kind,
            Err(error) => match error.skip_reason() {
                Some(reason) => OutcomeKind::Skipped(reason),
                None => OutcomeKind::Failed(error.to_string()),
            },
        };

        match &kind {
            OutcomeKind::Indexed { chunks } => {
                info!(path = %path.display(), document_id = %document_id, chunks = *chunks, "indexed pdf")
            }
            OutcomeKind::Skipped(reason) => {
                warn!(path = %path.display(), reason = %reason, "skipped pdf")
            }
            OutcomeKind::Failed(message) => {
                warn!(path = %path.display(), error = %message, "failed to index pdf")
            }
        }

        DocumentOutcome {
            path,
            document_id: Some(document_id),
            kind,
        }
    }

    async fn try_index_file(
        &self,
        path: &Path,
        file_path: &str,
        document_id: &str,
        hash: &str,
        force: bool,
    ) -> Result<OutcomeKind, IngestError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
            .to_string();

        let existing = self.documents.find_by_path(file_path).await?;

        if !force {
            if let Some(document) = &existing {
                if document.content_hash == hash {
                    match document.status {
                        DocumentStatus::Completed => {
                            return Ok(OutcomeKind::Skipped(SkipReason::AlreadyIndexed))
                        }
                        DocumentStatus::Failed => {
                            return Ok(OutcomeKind::Skipped(SkipReason::PreviouslyFailed(
                                document.error_message.clone().unwrap_or_default(),
                            )))
                        }
                        _ => {}
                    }
                }
            }

            if let Some(original) = self.documents.find_completed_by_hash(hash).await? {
                if original.file_path != file_path {
                    return Ok(OutcomeKind::Skipped(SkipReason::DuplicateContent {
                        original: original.name,
                    }));
                }
            }
        }

        if let Some(document) = &existing {
            self.vectors.delete_document(&document.id).await?;
            debug!(document_id = %document.id, "removed prior chunks");
        }

        let extractor = Arc::clone(&self.extractor);
        let probe_path = path.to_path_buf();
        let probed = tokio::task::spawn_blocking(move || extractor.probe(&probe_path))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))?;

        let page_count = match probed {
            Ok(page_count) => page_count,
            Err(error) => {
                if let Some(reason) = error.skip_reason() {
                    let mut document = fresh_document(existing, document_id, &name, file_path, 1, hash)?;
                    document.mark_processing()?;
                    document.mark_failed(reason.to_string())?;
                    self.documents.insert(&document).await?;
                }
                return Err(error);
            }
        };

        let mut document = fresh_document(existing, document_id, &name, file_path, page_count, hash)?;
        self.documents.insert(&document).await?;
        document.mark_processing()?;
        self.documents.update(&document).await?;

        let chunk_count = match self.process(path, &document).await {
            Ok(chunk_count) => chunk_count,
            Err(error) => return Err(self.fail_document(&mut document, error).await),
        };

        let mut completed = document.clone();
        completed.mark_completed(chunk_count)?;
        if let Err(error) = self.documents.update(&completed).await {
            return Err(self.fail_document(&mut document, error.into()).await);
        }

        Ok(OutcomeKind::Indexed {
            chunks: chunk_count,
        })
    }

    async fn process(&self, path: &Path, document: &Document) -> Result<u32, IngestError> {
        let extractor = Arc::clone(&self.extractor);
        let extract_path = path.to_path_buf();
        let pages = tokio::task::spawn_blocking(move || extractor.extract_pages(&extract_path))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))??;

        let no_text = || IngestError::NoExtractableText {
            path: path.display().to_string(),
        };
        if !pages.iter().any(PageText::has_content) {
            return Err(no_text());
        }

        let drafts = self.chunker.chunk_document(&pages).await;
        if drafts.is_empty() {
            return Err(no_text());
        }

        let chunks = build_chunks(document, drafts);
        let texts = chunks
            .iter()
            .map(|chunk| chunk.content.clone())
            .collect::<Vec<_>>();
        let embeddings = self.embedder.embed(&texts).await?;

        self.vectors.upsert_chunks(&chunks, &embeddings).await?;
        Ok(chunks.len() as u32)
    }

    async fn fail_document(&self, document: &mut Document, error: IngestError) -> IngestError {
        if let Err(cleanup) = self.vectors.delete_document(&document.id).await {
            warn!(document_id = %document.id, error = %cleanup, "failed to remove chunks of failed document");
        }

        let message = error
            .skip_reason()
            .map_or_else(|| error.to_string(), |reason| reason.to_string());
        match document.mark_failed(message) {
            Ok(()) => {
                if let Err(store_error) = self.documents.update(document).await {
                    warn!(document_id = %document.id, error = %store_error, "failed to record document failure");
                }
            }
            Err(transition) => {
                warn!(document_id = %document.id, error = %transition, "failed to record document failure")
            }
        }
        error
    }

    /// Removes every chunk and every document row. Returns `(documents, chunks)`.
    pub async fn clear_all(&self) -> Result<(usize, usize), IngestError> {
        let chunks = self.vectors.delete_all().await?;
        let documents = self.documents.delete_all().await?;
        info!(documents, chunks, "cleared index");
        Ok((documents, chunks))
    }

    pub async fn status(&self) -> Result<IndexStatus, IngestError> {
        Ok(IndexStatus {
            documents: self.documents.list(None).await?,
            indexed_chunks: self.vectors.count().await?,
        })
    }
}

fn fresh_document(
    existing: Option<Document>,
    document_id: &str,
    name: &str,
    file_path: &str,
    page_count: u32,
    hash: &str,
) -> Result<Document, IngestError> {
    match existing {
        Some(mut document) if document.status.is_terminal() => {
            document.restart(page_count, hash)?;
            document.name = name.to_string();
            Ok(document)
        }
        _ => Ok(Document::new(document_id, name, file_path, page_count, hash)),
    }
}

fn absolute_path(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::{digest_file, discover_pdf_files, generate_document_id};
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discovery_honours_recursive_flag() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.pdf"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;

        assert_eq!(discover_pdf_files(base, true).len(), 2);
        assert_eq!(discover_pdf_files(base, false).len(), 1);
        Ok(())
    }

    #[test]
    fn discovery_is_case_insensitive_and_sorted_by_name() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        for name in ["Zeta.PDF", "alpha.pdf", "Beta.pdf", "notes.txt"] {
            fs::write(dir.path().join(name), b"x")?;
        }

        let names = discover_pdf_files(dir.path(), false)
            .into_iter()
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().to_string()))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["alpha.pdf", "Beta.pdf", "Zeta.PDF"]);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.pdf");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn document_ids_depend_on_path_only() {
        assert_eq!(generate_document_id("/a.pdf"), generate_document_id("/a.pdf"));
        assert_ne!(generate_document_id("/a.pdf"), generate_document_id("/b.pdf"));
    }
}
