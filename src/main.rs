//! # Knowledge Space CLI (`kb`)
//!
//! Starts the API server and background workers, and covers the operator
//! tasks that don't belong in the API: creating the database, seeding users,
//! inspecting the job queue, and searching a knowledge base from a shell.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb serve [--workers N]` | Start the HTTP API, optionally with embedded workers |
//! | `kb worker [--concurrency N]` | Process background jobs until Ctrl-C |
//! | `kb user create` / `kb user list` | Manage accounts |
//! | `kb search <kb_id> "<query>"` | Search one knowledge base |
//! | `kb embed pending` | Backfill missing embeddings |
//! | `kb stats` | Per-space index counts and queue summary |
//! | `kb jobs list` / `retry` / `cancel` | Inspect and steer the job queue |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use knowledge_space::{commands, config, logging, migrate, server, stats};

/// Knowledge Space: spaces, knowledge bases, background ingestion, hybrid
/// search, and retrieval-augmented chat.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Knowledge Space — a self-hosted knowledge platform with hybrid search and chat",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Verbose logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it against an existing database is safe.
    Init,

    /// Start the HTTP API server.
    Serve {
        /// Run this many job workers inside the server process.
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },

    /// Run background workers (ingestion, crawling, embedding).
    Worker {
        /// Concurrent jobs; defaults to `worker.concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Manage user accounts.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Search a knowledge base.
    Search {
        /// Knowledge base id.
        kb_id: String,

        /// The search query string.
        query: String,

        /// `keyword`, `semantic`, or `hybrid`. Defaults to hybrid when
        /// embeddings are enabled, keyword otherwise.
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Show index and queue statistics.
    Stats,

    /// Inspect the job queue.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create an account.
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Display name; defaults to the part of the email before `@`.
        #[arg(long)]
        name: Option<String>,
    },
    /// List accounts.
    List,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that have no vector for the configured model.
    Pending {
        /// Only this knowledge base.
        #[arg(long)]
        kb: Option<String>,

        /// Override the batch size from config.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List recent jobs, newest first.
    List {
        /// Filter by status (`queued`, `running`, `succeeded`, `failed`, `cancelled`).
        #[arg(long)]
        status: Option<String>,

        /// Filter by space id.
        #[arg(long)]
        space: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Requeue a failed or cancelled job.
    Retry { id: String },
    /// Cancel a queued job.
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve { workers } => {
            server::serve(&cfg, workers).await?;
        }
        Commands::Worker { concurrency } => {
            commands::run_worker(&cfg, concurrency).await?;
        }
        Commands::User { action } => match action {
            UserAction::Create {
                email,
                password,
                name,
            } => {
                commands::run_user_create(&cfg, &email, &password, name.as_deref()).await?;
            }
            UserAction::List => {
                commands::run_user_list(&cfg).await?;
            }
        },
        Commands::Search {
            kb_id,
            query,
            mode,
            limit,
        } => {
            commands::run_search(&cfg, &kb_id, &query, mode.as_deref(), limit).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                kb,
                batch_size,
                dry_run,
            } => {
                commands::run_embed_pending(&cfg, kb.as_deref(), batch_size, dry_run).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Jobs { action } => match action {
            JobsAction::List {
                status,
                space,
                limit,
            } => {
                commands::run_jobs_list(&cfg, space.as_deref(), status.as_deref(), limit).await?;
            }
            JobsAction::Retry { id } => {
                commands::run_job_retry(&cfg, &id).await?;
            }
            JobsAction::Cancel { id } => {
                commands::run_job_cancel(&cfg, &id).await?;
            }
        },
    }

    Ok(())
}
