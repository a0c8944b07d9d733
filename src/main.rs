//! # docrag CLI
//!
//! Command-line front end for the document-chat pipeline.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag init` | Create the SQLite database and index directory |
//! | `docrag add <file>` | Register a document for a user |
//! | `docrag list` | List a user's documents |
//! | `docrag ingest <doc-id>` | Run one ingestion synchronously |
//! | `docrag reindex <doc-id>` | Rebuild an index artifact from stored chunks |
//! | `docrag worker` | Run the ingestion worker pool with retries |
//! | `docrag ask "<q>"` | Ask a question against the user's documents |
//! | `docrag history <session-id>` | Print a session transcript |
//!
//! All commands accept `--config` pointing to a TOML configuration file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::Row;
use std::path::PathBuf;

use docrag::{
    config, db, embedding, generation, index_store::IndexStore, ingest, migrate, respond, tasks,
};

#[derive(Parser)]
#[command(
    name = "docrag",
    about = "Document-grounded chat over your own files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and index directory. Idempotent.
    Init,

    /// Register a document and queue it for processing.
    Add {
        /// Path to a pdf, docx, or txt file.
        file: PathBuf,
        /// Owning user.
        #[arg(long)]
        owner: String,
        /// Display title; defaults to the file stem.
        #[arg(long)]
        title: Option<String>,
        /// Also run the ingestion immediately.
        #[arg(long)]
        now: bool,
    },

    /// List a user's documents and their processing state.
    List {
        #[arg(long)]
        owner: String,
    },

    /// Run one ingestion synchronously (no retry scheduling).
    Ingest {
        /// Document id from `docrag add`.
        document_id: String,
    },

    /// Rebuild a document's index artifact from its stored chunks,
    /// without re-embedding. Use after losing the index directory.
    Reindex {
        /// Document id from `docrag add`.
        document_id: String,
    },

    /// Run the ingestion worker pool until interrupted. Picks up every
    /// unprocessed document at startup and retries failures with backoff.
    Worker,

    /// Ask a question against the owner's processed documents.
    Ask {
        question: String,
        #[arg(long)]
        owner: String,
        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
    },

    /// Print a session transcript, oldest first.
    History { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docrag=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            IndexStore::open(&config.index.root)?;
            pool.close().await;
            println!("initialized");
        }

        Commands::Add {
            file,
            owner,
            title,
            now,
        } => {
            let pool = db::connect(&config).await?;
            let title = title.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "untitled".to_string())
            });
            let file = std::fs::canonicalize(&file)?;
            let document_id = ingest::register_document(&pool, &owner, &title, &file).await?;
            println!("added {document_id}");

            if now {
                let store = IndexStore::open(&config.index.root)?;
                let embedder = embedding::create_client(&config.embedding)?;
                let message =
                    ingest::run_ingest(&config, &pool, &store, embedder.as_ref(), &document_id)
                        .await?;
                println!("{message}");
            } else {
                println!("run `docrag ingest {document_id}` or `docrag worker` to process it");
            }
            pool.close().await;
        }

        Commands::List { owner } => {
            let pool = db::connect(&config).await?;
            let documents = ingest::list_documents(&pool, &owner).await?;
            if documents.is_empty() {
                println!("no documents for {owner}");
            }
            for doc in documents {
                let state = if doc.processed { "processed" } else { "pending" };
                println!("{}  [{}] {} ({})", doc.id, state, doc.title, doc.file_type);
            }
            pool.close().await;
        }

        Commands::Ingest { document_id } => {
            let pool = db::connect(&config).await?;
            let store = IndexStore::open(&config.index.root)?;
            let embedder = embedding::create_client(&config.embedding)?;
            let message =
                ingest::run_ingest(&config, &pool, &store, embedder.as_ref(), &document_id).await?;
            println!("{message}");
            pool.close().await;
        }

        Commands::Reindex { document_id } => {
            let pool = db::connect(&config).await?;
            let store = IndexStore::open(&config.index.root)?;
            let message = ingest::rebuild_index(&config, &pool, &store, &document_id).await?;
            println!("{message}");
            pool.close().await;
        }

        Commands::Worker => {
            let pool = db::connect(&config).await?;
            let store = IndexStore::open(&config.index.root)?;
            let embedder = embedding::create_client(&config.embedding)?;

            let (queue, _handles) = tasks::start(config.clone(), pool.clone(), store, embedder);
            let pending = tasks::enqueue_pending(&pool, &queue).await?;
            println!("worker running ({pending} pending documents); press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            println!("stopping");
            pool.close().await;
        }

        Commands::Ask {
            question,
            owner,
            session,
        } => {
            let pool = db::connect(&config).await?;
            let store = IndexStore::open(&config.index.root)?;
            let embedder = embedding::create_client(&config.embedding)?;
            let generator = generation::create_client(&config.generation)?;

            let session_id = match session {
                Some(id) => {
                    let existing = respond::get_session(&pool, &id).await?;
                    if existing.owner != owner {
                        anyhow::bail!("session {id} belongs to another user");
                    }
                    existing.id
                }
                None => {
                    let title: String = question.chars().take(64).collect();
                    respond::create_session(&pool, &owner, &title).await?
                }
            };

            let message_id = respond::record_user_message(&pool, &session_id, &question).await?;
            let answer = respond::respond(
                &config,
                &pool,
                &store,
                embedder.as_ref(),
                generator.as_ref(),
                &session_id,
                &message_id,
            )
            .await?;

            println!("{answer}");
            println!();
            println!("session: {session_id}");

            print_sources(&pool, &session_id).await?;
            pool.close().await;
        }

        Commands::History { session_id } => {
            let pool = db::connect(&config).await?;
            let session = respond::get_session(&pool, &session_id).await?;
            let messages = respond::session_transcript(&pool, &session.id).await?;

            if messages.is_empty() {
                println!("no messages in session {session_id}");
            }
            for message in messages {
                let role = if message.is_user { "you" } else { "bot" };
                println!("[{role}] {}", message.text);
            }
            pool.close().await;
        }
    }

    Ok(())
}

/// Print the source documents behind the latest bot message of a session.
async fn print_sources(pool: &sqlx::SqlitePool, session_id: &str) -> Result<()> {
    let rows = sqlx::query(
        r#"
        SELECT d.title AS title, c.chunk_index AS chunk_index
        FROM message_references r
        JOIN chunks c ON c.id = r.chunk_id
        JOIN documents d ON d.id = c.document_id
        WHERE r.message_id = (
            SELECT id FROM chat_messages
            WHERE session_id = ? AND is_user = 0
            ORDER BY created_at DESC, id DESC LIMIT 1
        )
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    if !rows.is_empty() {
        println!("sources:");
        for row in rows {
            println!(
                "  {} (chunk {})",
                row.get::<String, _>("title"),
                row.get::<i64, _>("chunk_index")
            );
        }
    }
    Ok(())
}
