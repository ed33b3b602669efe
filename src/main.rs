//! # KB Engine CLI (`kbe`)
//!
//! The `kbe` binary is the operational interface for KB Engine. It covers
//! database initialization, knowledge-base management, document ingestion,
//! one-shot questions, course generation, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! kbe --config ./config/kbe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbe init` | Create the SQLite database and run schema migrations |
//! | `kbe create-kb <name>` | Create a knowledge base |
//! | `kbe ingest <file> --kb <id>` | Ingest one document into a knowledge base |
//! | `kbe ask "<question>" --kb <id>` | Ask a question against a knowledge base |
//! | `kbe course "<topic>" --kb <id>` | Generate a course from a knowledge base |
//! | `kbe serve` | Start the HTTP API server |

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kb_engine::chat::ChatAgent;
use kb_engine::config::{load_config, Config};
use kb_engine::course::CourseGenerator;
use kb_engine::embedding::create_embedder;
use kb_engine::extract::ExtractorRegistry;
use kb_engine::llm::OpenAiChat;
use kb_engine::pipeline::{process_document, PipelineDeps};
use kb_engine::progress::StderrProgress;
use kb_engine::retrieval::RetrievalTool;
use kb_engine::store::Store;
use kb_engine::transport::{Transport, TransportEvent};
use kb_engine::vector_index::QdrantIndex;

#[derive(Parser)]
#[command(
    name = "kbe",
    about = "KB Engine — a multi-tenant knowledge-base assistant engine",
    version,
    long_about = "KB Engine ingests documents into per-tenant knowledge bases, indexes them \
    for semantic retrieval, and serves retrieval-augmented chat and course generation on top \
    via a CLI and a streaming HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent.
    Init,

    /// Create a knowledge base.
    CreateKb {
        /// Knowledge base name.
        name: String,

        /// Optional description.
        #[arg(long)]
        description: Option<String>,
    },

    /// Ingest a document into a knowledge base.
    ///
    /// Classifies the file, extracts its text, chunks and embeds it, and
    /// indexes the result. Runs in the foreground with chunk-level
    /// progress on stderr.
    Ingest {
        /// Path to the file to ingest.
        file: PathBuf,

        /// Knowledge base id.
        #[arg(long)]
        kb: i64,
    },

    /// Ask a question against a knowledge base.
    ///
    /// Starts a new conversation (or continues one with `--conversation`)
    /// and streams the answer to stdout, followed by its sources.
    Ask {
        /// The question.
        question: String,

        /// Knowledge base id.
        #[arg(long)]
        kb: i64,

        /// Continue an existing conversation instead of starting one.
        #[arg(long)]
        conversation: Option<i64>,
    },

    /// Generate a course from a knowledge base.
    ///
    /// Plans sections, drafts each against retrieved passages, runs the
    /// review loop, and stores the finished lessons. Progress streams to
    /// stderr; lessons print to stdout.
    Course {
        /// Course topic.
        topic: String,

        /// Knowledge base id.
        #[arg(long)]
        kb: i64,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

/// Everything the generative commands need, built once per invocation.
struct Engine {
    store: Store,
    pipeline: PipelineDeps,
    chat: ChatAgent,
    courses: CourseGenerator,
}

async fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let pool = kb_engine::db::connect(&config.db.path).await?;
    kb_engine::migrate::run_migrations(&pool).await?;
    let store = Store::new(pool);

    let embedder: Arc<dyn kb_engine::embedding::Embedder> =
        Arc::from(create_embedder(&config.embedding)?);
    let index = Arc::new(QdrantIndex::connect(&config.vector_store.url)?);
    let registry = Arc::new(ExtractorRegistry::with_defaults(&config.media));
    let retrieval = Arc::new(RetrievalTool::new(
        embedder.clone(),
        index.clone(),
        config.retrieval.top_k as usize,
    ));
    let llm: Arc<dyn kb_engine::llm::LlmClient> = Arc::new(OpenAiChat::new(&config.llm)?);

    Ok(Engine {
        store: store.clone(),
        pipeline: PipelineDeps {
            store: store.clone(),
            registry,
            embedder,
            index,
            chunking: config.chunking.clone(),
        },
        chat: ChatAgent::new(store.clone(), llm.clone(), retrieval.clone()),
        courses: CourseGenerator::new(store, llm, retrieval, config.course.clone()),
    })
}

/// Prints streamed events to the terminal: answer tokens and lesson
/// bodies on stdout, progress and review chatter on stderr.
struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send(&self, event: TransportEvent) -> kb_engine::Result<()> {
        match event {
            TransportEvent::Message { text } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            TransportEvent::Sources { sources } => {
                println!("\n\nSources:");
                for source in sources {
                    let excerpt: String = source.text.chars().take(100).collect();
                    println!("  [{}] {}", source.index, excerpt.replace('\n', " "));
                }
            }
            TransportEvent::Title { title } => {
                eprintln!("(conversation titled: {title})");
            }
            TransportEvent::Status { state } => {
                eprintln!("... {state}");
            }
            TransportEvent::Log { message } => {
                eprintln!("{message}");
            }
            TransportEvent::ReviewFeedback {
                section,
                accepted,
                notes,
            } => {
                if accepted {
                    eprintln!("review: '{section}' accepted");
                } else {
                    eprintln!("review: '{section}' sent back: {notes}");
                }
            }
            TransportEvent::Section { title, content, .. } => {
                println!("\n## {title}\n\n{content}");
            }
            TransportEvent::Error { message } => {
                eprintln!("error: {message}");
            }
            TransportEvent::End => {
                println!();
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = kb_engine::db::connect(&config.db.path).await?;
            kb_engine::migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }

        Commands::CreateKb { name, description } => {
            let pool = kb_engine::db::connect(&config.db.path).await?;
            kb_engine::migrate::run_migrations(&pool).await?;
            let store = Store::new(pool);
            let kb = store
                .create_knowledge_base(&name, description.as_deref())
                .await?;
            println!("Created knowledge base {} ('{}')", kb.id, kb.name);
        }

        Commands::Ingest { file, kb } => {
            let engine = build_engine(&config).await?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            let kind = kb_engine::classify::classify(&file);
            let document = engine
                .store
                .create_document(kb, &file_name, kind, &file.to_string_lossy())
                .await?;
            let summary =
                process_document(&engine.pipeline, document.id, &StderrProgress).await?;
            println!(
                "Ingested '{}' as document {} ({} chunks)",
                file_name, document.id, summary.chunk_count
            );
        }

        Commands::Ask {
            question,
            kb,
            conversation,
        } => {
            let engine = build_engine(&config).await?;
            let conversation_id = match conversation {
                Some(id) => engine.store.get_conversation(id).await?.id,
                None => {
                    let created = engine.store.create_conversation(kb).await?;
                    eprintln!("(conversation {})", created.id);
                    created.id
                }
            };
            engine
                .chat
                .run_turn(conversation_id, &question, &ConsoleTransport)
                .await?;
        }

        Commands::Course { topic, kb } => {
            let engine = build_engine(&config).await?;
            let lessons = engine.courses.generate(kb, &topic, &ConsoleTransport).await?;
            eprintln!("Stored {} lessons.", lessons.len());
        }

        Commands::Serve => {
            kb_engine::server::run_server(&config).await?;
        }
    }

    Ok(())
}
