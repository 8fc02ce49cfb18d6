//! # docqa CLI
//!
//! Runs the HTTP/WebSocket server and exposes the same ingestion and
//! question-answering operations from the command line.
//!
//! ## Usage
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa serve` | Start the HTTP and WebSocket server |
//! | `docqa upsert` | Load files into a collection, one loader per file |
//! | `docqa ingest` | Extract (HTML/Markdown/XML) and upsert files as one batch |
//! | `docqa query` | Similarity search |
//! | `docqa ask` | Stream an answer to stdout |
//! | `docqa clear` | Delete a collection |
//!
//! ## Examples
//!
//! ```bash
//! docqa upsert --collection handbook docs/handbook.pdf
//! docqa ingest --collection site --source website --format html --selector main page.html
//! docqa ask --collection handbook "How do I request leave?"
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docqa::config::{self, Config};
use docqa::engine::Engine;
use docqa::extract::{ExtractionFilter, ExtractionFormat};
use docqa::loader::{loader_for_path, DocumentLoader};
use docqa::models::RawContentItem;
use docqa::qna::QnaRequest;
use docqa::server;

#[derive(Parser)]
#[command(
    name = "docqa",
    about = "Retrieval-augmented question answering over your documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    /// Enable debug logging. `RUST_LOG` takes precedence when set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket server on `[server].bind`.
    Serve,

    /// Load files into a collection.
    ///
    /// `.pdf` files are parsed as PDF, everything else is read as text.
    /// Chunks are tagged with the loader name as their source.
    Upsert {
        #[arg(long)]
        collection: String,

        files: Vec<PathBuf>,
    },

    /// Extract text from files and upsert it as one batch.
    Ingest {
        #[arg(long)]
        collection: String,

        /// Source tag written into every chunk.
        #[arg(long)]
        source: String,

        /// `html`, `md`, `xml`, or `none`.
        #[arg(long, default_value = "none")]
        format: String,

        /// CSS selector (html) or XPath expression (xml).
        #[arg(long)]
        selector: Option<String>,

        files: Vec<PathBuf>,
    },

    /// Print the chunks most similar to a query as JSON.
    Query {
        #[arg(long)]
        collection: String,

        query: String,

        #[arg(long)]
        source: Option<String>,

        #[arg(short)]
        k: Option<usize>,
    },

    /// Answer a question, streaming the reply.
    Ask {
        #[arg(long)]
        collection: String,

        question: String,

        #[arg(long)]
        source: Option<String>,

        /// Only use chunks scoring at least this similarity.
        #[arg(long)]
        min_similarity: Option<f32>,

        #[arg(short)]
        k: Option<usize>,

        /// Extra instructions appended to the prompt.
        #[arg(long)]
        instructions: Option<String>,
    },

    /// Delete a collection and everything in it.
    Clear {
        #[arg(long)]
        collection: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "docqa=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Upsert { collection, files } => {
            let engine = engine(&cfg)?;
            let loaders: Vec<Box<dyn DocumentLoader>> =
                files.into_iter().map(loader_for_path).collect();
            let report = engine.collection(&collection)?.upsert(&loaders).await?;
            println!("Upserted {} chunks into {}", report.chunks, collection);
        }
        Commands::Ingest {
            collection,
            source,
            format,
            selector,
            files,
        } => {
            let engine = engine(&cfg)?;
            let mut items = Vec::with_capacity(files.len());
            for file in &files {
                let content = tokio::fs::read_to_string(file)
                    .await
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                items.push(RawContentItem::new(content).with_metadata("url", file.display().to_string()));
            }
            let filter = ExtractionFilter::new(
                ExtractionFormat::from_descriptor(&format, selector.as_deref()),
                source,
            );
            let report = engine
                .collection(&collection)?
                .upsert_content(&items, &filter)
                .await?;
            println!("Upserted {} chunks into {}", report.chunks, collection);
        }
        Commands::Query {
            collection,
            query,
            source,
            k,
        } => {
            let engine = engine(&cfg)?;
            let k = k.unwrap_or(cfg.retrieval.default_k);
            let results = engine
                .collection(&collection)?
                .query(&query, source.as_deref(), k)
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Ask {
            collection,
            question,
            source,
            min_similarity,
            k,
            instructions,
        } => {
            let engine = engine(&cfg)?;
            let request = QnaRequest {
                question,
                min_similarity,
                k: k.unwrap_or(cfg.retrieval.default_k),
                source,
                additional_instructions: instructions,
            };
            let mut answer = engine.collection(&collection)?.qna(&request).await?;
            let mut stdout = std::io::stdout();
            while let Some(fragment) = answer.next().await {
                stdout.write_all(fragment.as_bytes())?;
                stdout.flush()?;
            }
            println!();
        }
        Commands::Clear { collection } => {
            let engine = engine(&cfg)?;
            if engine.collection(&collection)?.clear().await? {
                println!("Deleted collection {}", collection);
            } else {
                println!("Collection {} does not exist", collection);
            }
        }
    }

    Ok(())
}

fn engine(cfg: &Config) -> anyhow::Result<Arc<Engine>> {
    Ok(Arc::new(Engine::from_config(cfg)?))
}
