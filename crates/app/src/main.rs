use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_rag_core::config::{ProviderKind, RerankKind, RerankSettings, VectorBackend};
use pdf_rag_core::{
    AnswerSynthesizer, BoundaryDetector, CharacterNgramEmbedder, CrossEncoder, DocumentStatus,
    DocumentStore, Embedder, EmbeddingService, GenerationService, HttpCrossEncoder, InMemoryVectorIndex,
    InMemoryDocumentStore, IndexStatus, Indexer, IndexingSummary, LexicalCrossEncoder, LopdfExtractor,
    OpenAiClient, QdrantStore, Reranker, SearchCoordinator, SemanticChunker, Settings,
    SqliteDocumentStore, VectorIndex,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version, about = "Ask questions about a folder of PDFs and get verbatim citations.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file (default: ./pdf-rag.toml, then ~/.pdf-rag/config.toml)
    #[arg(long, global = true, env = "PDF_RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Index every PDF in a folder.
    Index {
        /// Folder that contains the PDFs.
        folder: PathBuf,
        /// Descend into subfolders.
        #[arg(short, long, default_value_t = false)]
        recursive: bool,
        /// Reindex documents that are already completed or failed.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Documents processed in parallel.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Answer a question from the indexed documents.
    Query {
        question: String,
        /// Maximum number of sources passed to the answer model.
        #[arg(long)]
        max_sources: Option<usize>,
        /// Candidates fetched from the vector index.
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the response as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Leave quotes out of the text output.
        #[arg(long, default_value_t = false)]
        no_quotes: bool,
    },
    /// Show indexed documents by status.
    Status,
    /// Remove every document and chunk from the index.
    Clear {
        /// Confirm the removal.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

struct Services {
    embedding: Arc<dyn EmbeddingService>,
    generation: Option<Arc<dyn GenerationService>>,
    detector: Option<Arc<dyn BoundaryDetector>>,
}

type CliIndexer = Indexer<dyn VectorIndex, dyn DocumentStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    init_tracing(settings.log_level.as_deref(), cli.verbose);
    settings.validate()?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-rag boot"
    );

    let services = build_services(&settings)?;
    let vectors = open_vector_index(&settings, services.embedding.dimensions()).await?;

    match cli.command {
        Command::Index {
            folder,
            recursive,
            force,
            workers,
        } => {
            let indexer = open_indexer(&settings, &services, vectors).await?;
            let mut options = settings.ingestion_options(force);
            options.recursive |= recursive;
            if let Some(workers) = workers {
                options.workers = workers.max(1);
            }
            let summary = indexer.index_folder(&folder, &options).await?;
            print_summary(&summary);
        }
        Command::Query {
            question,
            max_sources,
            top_k,
            json,
            no_quotes,
        } => {
            let Some(generation) = services.generation.clone() else {
                bail!("answering questions needs a generation model; set provider.kind = \"openai\"");
            };

            let options = settings.retrieval_options();
            let reranker = Reranker::new(
                build_cross_encoder(&settings.rerank, settings.provider.timeout())?,
                settings.rerank.relevance_floor,
            );
            let synthesizer = AnswerSynthesizer::new(
                generation,
                settings.provider.retry_policy(),
                options.max_chunks_per_document,
            );
            let embedder = Embedder::new(services.embedding.clone(), settings.provider.retry_policy());
            let coordinator = SearchCoordinator::new(vectors, embedder, reranker, synthesizer, options.clone());

            let response = coordinator
                .ask_with(
                    &question,
                    top_k.unwrap_or(options.top_k).max(1),
                    max_sources.unwrap_or(options.max_sources).max(1),
                )
                .await
                .map_err(|error| {
                    let rate_limited = error.is_rate_limited();
                    let error = anyhow::Error::new(error);
                    if rate_limited {
                        error.context("provider rate limit reached, retry in a moment")
                    } else {
                        error
                    }
                })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.render_text(!no_quotes));
            }
        }
        Command::Status => {
            let indexer = open_indexer(&settings, &services, vectors).await?;
            print_status(&indexer.status().await?);
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("refusing to clear the index without --yes");
            }
            let indexer = open_indexer(&settings, &services, vectors).await?;
            let (documents, chunks) = indexer.clear_all().await?;
            println!("Removed {documents} documents and {chunks} chunks");
        }
    }

    Ok(())
}

fn init_tracing(log_level: Option<&str>, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.unwrap_or("info")))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_services(settings: &Settings) -> anyhow::Result<Services> {
    match settings.provider.kind {
        ProviderKind::OpenAi => {
            let client = Arc::new(OpenAiClient::new(&settings.provider)?);
            let detector = settings
                .chunking
                .semantic_boundaries
                .then(|| client.clone() as Arc<dyn BoundaryDetector>);
            Ok(Services {
                embedding: client.clone(),
                generation: Some(client as Arc<dyn GenerationService>),
                detector,
            })
        }
        ProviderKind::Local => Ok(Services {
            embedding: Arc::new(CharacterNgramEmbedder::new(settings.provider.embedding_dimensions)),
            generation: None,
            detector: None,
        }),
    }
}

async fn open_vector_index(settings: &Settings, dimensions: usize) -> anyhow::Result<Arc<dyn VectorIndex>> {
    let storage = &settings.storage;
    match storage.vector_backend {
        VectorBackend::Qdrant => {
            let store = QdrantStore::new(
                &storage.qdrant_url,
                &storage.qdrant_collection,
                dimensions,
                settings.provider.timeout(),
            )?;
            store
                .ensure_collection()
                .await
                .with_context(|| format!("qdrant collection {} at {}", storage.qdrant_collection, storage.qdrant_url))?;
            Ok(Arc::new(store) as Arc<dyn VectorIndex>)
        }
        VectorBackend::Memory => {
            warn!("memory backend keeps chunks and document records for this process only");
            Ok(Arc::new(InMemoryVectorIndex::new(dimensions)) as Arc<dyn VectorIndex>)
        }
    }
}

async fn open_indexer(
    settings: &Settings,
    services: &Services,
    vectors: Arc<dyn VectorIndex>,
) -> anyhow::Result<CliIndexer> {
    let documents = open_document_store(settings).await?;
    let config = settings.chunking_config();
    let chunker = match &services.detector {
        Some(detector) => SemanticChunker::with_detector(config, detector.clone()),
        None => SemanticChunker::new(config),
    };
    let embedder = Embedder::new(services.embedding.clone(), settings.provider.retry_policy());

    Ok(Indexer::new(
        vectors,
        documents,
        Arc::new(LopdfExtractor),
        chunker,
        embedder,
    )?)
}

/// Document records live as long as the chunks they describe, so the memory
/// vector backend gets an in-process document store too.
async fn open_document_store(settings: &Settings) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match settings.storage.vector_backend {
        VectorBackend::Qdrant => {
            let db_path = settings.storage.metadata_db_path();
            let store = SqliteDocumentStore::connect(&db_path)
                .await
                .with_context(|| format!("opening metadata store {}", db_path.display()))?;
            Ok(Arc::new(store) as Arc<dyn DocumentStore>)
        }
        VectorBackend::Memory => Ok(Arc::new(InMemoryDocumentStore::new()) as Arc<dyn DocumentStore>),
    }
}

fn build_cross_encoder(settings: &RerankSettings, timeout: Duration) -> anyhow::Result<Arc<dyn CrossEncoder>> {
    match settings.kind {
        RerankKind::Lexical => Ok(Arc::new(LexicalCrossEncoder::new())),
        RerankKind::Http => {
            let endpoint = settings
                .endpoint
                .as_deref()
                .context("rerank.endpoint is required for rerank.kind = \"http\"")?;
            Ok(Arc::new(HttpCrossEncoder::new(endpoint, settings.model.clone(), timeout)?))
        }
        RerankKind::Fastembed => load_local_cross_encoder(&settings.model),
    }
}

#[cfg(feature = "local-rerank")]
fn load_local_cross_encoder(model: &str) -> anyhow::Result<Arc<dyn CrossEncoder>> {
    Ok(Arc::new(pdf_rag_core::FastembedCrossEncoder::load(model)?))
}

#[cfg(not(feature = "local-rerank"))]
fn load_local_cross_encoder(_model: &str) -> anyhow::Result<Arc<dyn CrossEncoder>> {
    bail!("rerank.kind = \"fastembed\" needs a build with --features local-rerank")
}

fn print_summary(summary: &IndexingSummary) {
    println!(
        "Indexed {} of {} documents ({} chunks) in {:.1}s",
        summary.indexed,
        summary.total,
        summary.total_chunks,
        summary.elapsed.as_secs_f64()
    );

    if summary.skipped > 0 {
        println!("Skipped {}:", summary.skipped);
        for (path, reason) in summary.skipped_files() {
            println!("  {}: {reason}", path.display());
        }
    }
    if summary.failed > 0 {
        println!("Failed {}:", summary.failed);
        for (path, message) in summary.failed_files() {
            println!("  {}: {message}", path.display());
        }
    }
}

fn print_status(status: &IndexStatus) {
    let counts = DocumentStatus::ALL
        .iter()
        .map(|state| format!("{state} {}", status.count(*state)))
        .collect::<Vec<_>>()
        .join(", ");
    println!("Documents: {} ({counts})", status.documents.len());
    println!("Chunks: {}", status.indexed_chunks);

    if status.documents.is_empty() {
        return;
    }

    println!();
    println!("{:<10} {:>6} {:>6}  NAME", "STATUS", "PAGES", "CHUNKS");
    for document in &status.documents {
        let chunks = document
            .chunk_count
            .map_or_else(|| "-".to_string(), |count| count.to_string());
        println!(
            "{:<10} {:>6} {:>6}  {}",
            document.status.as_str(),
            document.page_count,
            chunks,
            document.name
        );
        if let Some(error) = &document.error_message {
            println!("{:<25}{error}", "");
        }
    }
}
