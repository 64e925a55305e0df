//! # Dossier CLI
//!
//! The `dossier` binary hosts the answering pipeline. It provides commands
//! for database initialization, one-shot document indexing, job cleanup, and
//! starting the HTTP API the UI talks to.
//!
//! ## Usage
//!
//! ```bash
//! dossier --config ./config/dossier.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dossier init` | Create the SQLite database and run schema migrations |
//! | `dossier serve` | Start the HTTP API server |
//! | `dossier index <file> --name <name>` | Index one document and wait for it |
//! | `dossier gc` | Remove terminal jobs past the retention window |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dossier::config::load_config;
use dossier::db::Store;
use dossier::embedding::create_embedder;
use dossier::indexer;
use dossier::jobs::JobTracker;
use dossier::migrate::run_migrations;
use dossier::models::{JobStatus, JobType};
use dossier::server::run_server;

/// Dossier — a questionnaire answering pipeline with cited, evaluable
/// answers.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dossier.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dossier",
    about = "Dossier — questionnaire answering over indexed reference documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dossier.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent —
    /// running it multiple times is safe.
    Init,

    /// Start the HTTP API server.
    ///
    /// Serves the endpoints the UI consumes and runs job workers in the
    /// background. Runs migrations on start so a fresh database works out of
    /// the box.
    Serve,

    /// Index a single document and wait for completion.
    ///
    /// Useful for seeding a corpus from scripts without going through the
    /// HTTP API.
    Index {
        /// Path to the source file (PDF, DOCX, or plain text).
        file: PathBuf,

        /// Display name recorded on the document and used in citations.
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove terminal jobs older than the retention window.
    Gc,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = Store::open(&config).await?;
            run_migrations(&store).await?;
            println!("database initialized at {}", config.db.path.display());
            store.close().await;
        }
        Commands::Serve => {
            let store = Store::open(&config).await?;
            run_migrations(&store).await?;
            run_server(&config, store).await?;
        }
        Commands::Index { file, name } => {
            let store = Store::open(&config).await?;
            run_migrations(&store).await?;

            let doc_name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| file.display().to_string())
            });

            let embedder = create_embedder(&config.embedding)?;
            let tracker = JobTracker::new(store.clone());

            let document =
                indexer::register_document(&store, &doc_name, &file.to_string_lossy()).await?;
            let job = tracker
                .create(JobType::Indexing, &document.id, "Indexing...")
                .await?;

            indexer::run_index_job(
                &store,
                embedder.as_ref(),
                &config.chunking,
                &tracker,
                &job.id,
                &document.id,
            )
            .await;

            let job = tracker.get(&job.id).await?;
            let document = indexer::get_document(&store, &document.id).await?;
            match job.status {
                JobStatus::Completed => {
                    println!("indexed {} ({} chunks)", document.name, document.chunk_count);
                }
                _ => {
                    anyhow::bail!(
                        "indexing failed: {}",
                        job.error.unwrap_or_else(|| "unknown error".to_string())
                    );
                }
            }
            store.close().await;
        }
        Commands::Gc => {
            let store = Store::open(&config).await?;
            run_migrations(&store).await?;
            let tracker = JobTracker::new(store.clone());
            let removed = tracker.gc(config.jobs.retention_secs).await?;
            println!("removed {} terminal jobs", removed);
            store.close().await;
        }
    }

    Ok(())
}
