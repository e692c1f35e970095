use async_trait::async_trait;
use pdf_rag_core::error::{IngestError, ProviderError};
use pdf_rag_core::traits::GenerationRequest;
use pdf_rag_core::{
    AnswerSynthesizer, CharacterNgramEmbedder, ChunkingConfig, DocumentStatus, Embedder,
    GenerationService, InMemoryDocumentStore, InMemoryVectorIndex, Indexer, IndexingSummary,
    IngestionOptions, LexicalCrossEncoder, OutcomeKind, PageText, PdfExtractor, Reranker,
    RetrievalOptions, RetryPolicy, SearchCoordinator, SemanticChunker, SkipReason,
};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const DIMENSIONS: usize = 128;

/// Serves canned page text keyed by file name.
struct FixtureExtractor {
    documents: HashMap<&'static str, Vec<PageText>>,
}

impl FixtureExtractor {
    fn new() -> Self {
        let handbook = (1..=45)
            .map(|number| {
                let text = match number {
                    10 => "People mentioned in this handbook: Alice Moreau leads onboarding for new hires.".to_string(),
                    23 => "Definition of terms. CSM means the Customer Success Manager assigned to each enterprise account.".to_string(),
                    _ => format!(
                        "Page {number} covers travel policy, expense reports and office logistics for staff members."
                    ),
                };
                PageText::new(number, text)
            })
            .collect();

        let roster = vec![
            PageText::new(1, "People mentioned in the roster: Bob Lindqvist runs the support desk."),
            PageText::new(2, "Shift rotations follow a weekly calendar shared with the facilities team."),
        ];

        let scanned = vec![PageText::new(1, "   "), PageText::new(2, "")];

        Self {
            documents: HashMap::from([
                ("handbook.pdf", handbook),
                ("roster.pdf", roster),
                ("scanned.pdf", scanned),
            ]),
        }
    }

    fn pages(&self, path: &Path) -> Result<&Vec<PageText>, IngestError> {
        let name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        if name == "locked.pdf" {
            return Err(IngestError::Encrypted {
                path: path.display().to_string(),
            });
        }
        self.documents.get(name).ok_or_else(|| IngestError::Unreadable {
            path: path.display().to_string(),
            details: "no fixture".to_string(),
        })
    }
}

impl PdfExtractor for FixtureExtractor {
    fn probe(&self, path: &Path) -> Result<u32, IngestError> {
        Ok(self.pages(path)?.len() as u32)
    }

    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        self.pages(path).cloned()
    }
}

/// Answers by quoting the first content line of every source it is given.
#[derive(Default)]
struct SourceQuotingGenerator {
    calls: AtomicUsize,
}

impl SourceQuotingGenerator {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationService for SourceQuotingGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut lines = request.user_message.lines();
        let mut citations = Vec::new();
        let mut answer = Vec::new();
        while let Some(line) = lines.next() {
            let Some(label) = line.strip_prefix("[Source ") else {
                continue;
            };
            let index = label
                .split(':')
                .next()
                .and_then(|number| number.trim().parse::<i64>().ok())
                .unwrap_or_default();
            let quote = lines.next().unwrap_or_default().trim().to_string();
            answer.push(format!("{quote} [Source {index}]"));
            citations.push(serde_json::json!({
                "source_index": index,
                "verbatim_quote": quote,
            }));
        }

        Ok(serde_json::json!({
            "answer": answer.join("\n"),
            "citations": citations,
            "not_found": citations.is_empty(),
        })
        .to_string())
    }
}

struct Harness {
    vectors: Arc<InMemoryVectorIndex>,
    indexer: Indexer<InMemoryVectorIndex, InMemoryDocumentStore>,
    coordinator: SearchCoordinator<InMemoryVectorIndex>,
    generator: Arc<SourceQuotingGenerator>,
}

impl Harness {
    fn new() -> Result<Self, IngestError> {
        let policy = RetryPolicy::no_retries(Duration::from_secs(5));
        let vectors = Arc::new(InMemoryVectorIndex::new(DIMENSIONS));
        let generator = Arc::new(SourceQuotingGenerator::default());
        let embedder = || Embedder::new(Arc::new(CharacterNgramEmbedder::new(DIMENSIONS)), policy.clone());

        let indexer = Indexer::new(
            vectors.clone(),
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(FixtureExtractor::new()),
            SemanticChunker::new(ChunkingConfig::default()),
            embedder(),
        )?;

        let options = RetrievalOptions {
            top_k: 60,
            ..RetrievalOptions::default()
        };
        let coordinator = SearchCoordinator::new(
            vectors.clone(),
            embedder(),
            Reranker::new(Arc::new(LexicalCrossEncoder::new()), 0.1),
            AnswerSynthesizer::new(generator.clone(), policy.clone(), options.max_chunks_per_document),
            options,
        );

        Ok(Self {
            vectors,
            indexer,
            coordinator,
            generator,
        })
    }

    async fn index(&self, folder: &Path, force: bool) -> Result<IndexingSummary, IngestError> {
        let options = IngestionOptions {
            force,
            ..IngestionOptions::default()
        };
        self.indexer.index_folder(folder, &options).await
    }
}

/// Writes one small file per name; the bytes differ so content hashes differ.
fn corpus(names: &[&str]) -> Result<TempDir, std::io::Error> {
    let dir = tempfile::tempdir()?;
    for name in names {
        std::fs::write(dir.path().join(name), format!("%PDF-1.7 fixture {name}"))?;
    }
    Ok(dir)
}

fn outcome_for<'a>(summary: &'a IndexingSummary, name: &str) -> Option<&'a OutcomeKind> {
    summary
        .outcomes
        .iter()
        .find(|outcome| outcome.path.file_name().and_then(|file| file.to_str()) == Some(name))
        .map(|outcome| &outcome.kind)
}

fn document_id_for(summary: &IndexingSummary, name: &str) -> Option<String> {
    summary
        .outcomes
        .iter()
        .find(|outcome| outcome.path.file_name().and_then(|file| file.to_str()) == Some(name))
        .and_then(|outcome| outcome.document_id.clone())
}

#[tokio::test]
async fn encrypted_file_is_skipped_and_the_rest_indexed() -> TestResult {
    let dir = corpus(&["handbook.pdf", "locked.pdf"])?;
    let harness = Harness::new()?;

    let summary = harness.index(dir.path(), false).await?;

    assert_eq!(summary.total, 2);
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(outcome_for(&summary, "locked.pdf"), Some(&OutcomeKind::Skipped(SkipReason::Encrypted)));
    assert_eq!(summary.total_chunks, 45);

    let status = harness.indexer.status().await?;
    assert_eq!(status.count(DocumentStatus::Completed), 1);
    assert_eq!(status.count(DocumentStatus::Failed), 1);
    assert_eq!(status.indexed_chunks, 45);
    Ok(())
}

#[tokio::test]
async fn reindexing_unchanged_files_is_a_no_op() -> TestResult {
    let dir = corpus(&["handbook.pdf", "locked.pdf"])?;
    let harness = Harness::new()?;

    let first = harness.index(dir.path(), false).await?;
    let document_id = document_id_for(&first, "handbook.pdf").ok_or("handbook has no document id")?;
    let before = harness.vectors.chunks_for(&document_id).await;

    let second = harness.index(dir.path(), false).await?;
    let after = harness.vectors.chunks_for(&document_id).await;

    assert_eq!(second.indexed, 0);
    assert_eq!(outcome_for(&second, "handbook.pdf"), Some(&OutcomeKind::Skipped(SkipReason::AlreadyIndexed)));
    assert!(matches!(
        outcome_for(&second, "locked.pdf"),
        Some(OutcomeKind::Skipped(SkipReason::PreviouslyFailed(_)))
    ));
    assert_eq!(before.len(), after.len());
    assert_eq!(
        before.iter().map(|chunk| &chunk.chunk_id).collect::<Vec<_>>(),
        after.iter().map(|chunk| &chunk.chunk_id).collect::<Vec<_>>()
    );
    Ok(())
}

#[tokio::test]
async fn forced_reindex_replaces_chunks_with_the_same_ids() -> TestResult {
    let dir = corpus(&["handbook.pdf", "locked.pdf"])?;
    let harness = Harness::new()?;

    let first = harness.index(dir.path(), false).await?;
    let document_id = document_id_for(&first, "handbook.pdf").ok_or("handbook has no document id")?;
    let before = harness.vectors.chunks_for(&document_id).await;

    let forced = harness.index(dir.path(), true).await?;

    assert_eq!(outcome_for(&forced, "handbook.pdf"), Some(&OutcomeKind::Indexed { chunks: 45 }));
    assert_eq!(outcome_for(&forced, "locked.pdf"), Some(&OutcomeKind::Skipped(SkipReason::Encrypted)));
    assert_eq!(harness.indexer.status().await?.indexed_chunks, 45);
    assert_eq!(harness.vectors.chunks_for(&document_id).await, before);
    Ok(())
}

#[tokio::test]
async fn duplicate_and_textless_files_are_skipped() -> TestResult {
    let dir = corpus(&["handbook.pdf", "scanned.pdf"])?;
    std::fs::copy(dir.path().join("handbook.pdf"), dir.path().join("z-handbook-copy.pdf"))?;
    let harness = Harness::new()?;

    let summary = harness.index(dir.path(), false).await?;

    assert_eq!(summary.indexed, 1);
    assert_eq!(
        outcome_for(&summary, "z-handbook-copy.pdf"),
        Some(&OutcomeKind::Skipped(SkipReason::DuplicateContent {
            original: "handbook.pdf".to_string()
        }))
    );
    assert_eq!(
        outcome_for(&summary, "scanned.pdf"),
        Some(&OutcomeKind::Skipped(SkipReason::NoExtractableText))
    );
    assert_eq!(summary.skipped_files().count(), 2);
    Ok(())
}

#[tokio::test]
async fn definition_question_cites_the_defining_page() -> TestResult {
    let dir = corpus(&["handbook.pdf", "locked.pdf"])?;
    let harness = Harness::new()?;
    harness.index(dir.path(), false).await?;

    let response = harness.coordinator.ask("What is the definition of CSM?").await?;

    assert!(!response.not_found);
    assert_eq!(response.citations.len(), 1);
    let citation = &response.citations[0];
    assert_eq!(citation.document_name, "handbook.pdf");
    assert_eq!(citation.page_number, 23);
    assert!(citation.verbatim_quote.contains("Customer Success Manager"));
    assert_eq!(response.metadata.quotes_verified, 1);
    assert_eq!(harness.generator.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn entity_question_aggregates_across_documents() -> TestResult {
    let dir = corpus(&["handbook.pdf", "roster.pdf"])?;
    let harness = Harness::new()?;
    harness.index(dir.path(), false).await?;

    let response = harness
        .coordinator
        .ask("Who are the people mentioned in the documents?")
        .await?;

    let cited = response
        .citations
        .iter()
        .map(|citation| citation.document_name.as_str())
        .collect::<BTreeSet<_>>();
    assert_eq!(cited, BTreeSet::from(["handbook.pdf", "roster.pdf"]));
    assert!(response.answer.contains("Alice Moreau"));
    assert!(response.answer.contains("Bob Lindqvist"));
    Ok(())
}

#[tokio::test]
async fn unrelated_question_is_not_found_without_generation() -> TestResult {
    let dir = corpus(&["handbook.pdf"])?;
    let harness = Harness::new()?;
    harness.index(dir.path(), false).await?;

    let response = harness
        .coordinator
        .ask("Quantum chromodynamics gluon confinement?")
        .await?;

    assert!(response.not_found);
    assert!(response.citations.is_empty());
    assert!(response.metadata.chunks_retrieved > 0);
    assert_eq!(harness.generator.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn every_citation_is_a_substring_of_its_chunk() -> TestResult {
    let dir = corpus(&["handbook.pdf", "roster.pdf"])?;
    let harness = Harness::new()?;
    let summary = harness.index(dir.path(), false).await?;

    let mut chunks = Vec::new();
    for name in ["handbook.pdf", "roster.pdf"] {
        let document_id = document_id_for(&summary, name).ok_or("missing document id")?;
        chunks.extend(harness.vectors.chunks_for(&document_id).await);
    }

    for question in [
        "What is the definition of CSM?",
        "Who are the people mentioned in the documents?",
        "Which calendar do shift rotations follow?",
    ] {
        let response = harness.coordinator.ask(question).await?;
        for citation in &response.citations {
            assert!(
                chunks.iter().any(|chunk| chunk.document_name == citation.document_name
                    && chunk.page_start == citation.page_number
                    && chunk.content.contains(&citation.verbatim_quote)),
                "citation {:?} is not a span of its chunk",
                citation.verbatim_quote
            );
        }
    }
    Ok(())
}

#[tokio::test]
async fn clear_all_empties_both_stores() -> TestResult {
    let dir = corpus(&["handbook.pdf", "roster.pdf"])?;
    let harness = Harness::new()?;
    harness.index(dir.path(), false).await?;

    let (documents, chunks) = harness.indexer.clear_all().await?;
    assert_eq!(documents, 2);
    assert_eq!(chunks, 47);

    let status = harness.indexer.status().await?;
    assert!(status.documents.is_empty());
    assert_eq!(status.indexed_chunks, 0);
    Ok(())
}

#[tokio::test]
async fn folder_without_pdfs_is_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("notes.txt"), "not a pdf")?;
    let harness = Harness::new()?;

    let result = harness.index(dir.path(), false).await;
    assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
    Ok(())
}
