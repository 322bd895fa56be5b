//! # Coach context CLI (`coachctx`)
//!
//! ## Usage
//!
//! ```bash
//! coachctx --config ./config/coachctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `coachctx init` | Create the SQLite database and run schema migrations |
//! | `coachctx docs add <file.json>` | Upsert knowledge documents and rebuild their chunks |
//! | `coachctx docs list` | List knowledge documents with chunk counts |
//! | `coachctx reembed <id\|all\|missing>` | Re-chunk and re-embed documents |
//! | `coachctx missing` | List documents that need embedding |
//! | `coachctx search "<query>"` | Run one knowledge query |
//! | `coachctx context --query "<q>" --history turns.json` | Assemble a full prompt context |
//! | `coachctx serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use coach_context::config;
use coach_context::engine::{Engine, SearchOptions};
use coach_context::{context, documents, migrate, reembed, search, server};
use coach_context_core::models::SearchMethod;

/// Context assembly engine for an LLM fitness coach.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/coachctx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "coachctx",
    about = "Knowledge retrieval and conversation windowing for an LLM coach",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/coachctx.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage knowledge documents.
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },

    /// Re-chunk and re-embed documents.
    ///
    /// Target: a document id, `all`, or `missing` (documents with no
    /// chunks or with chunks lacking vectors). Safe to repeat.
    Reembed { target: String },

    /// List documents that need embedding.
    Missing,

    /// Search the knowledge corpus.
    Search {
        query: String,

        /// semantic, keyword, or hybrid (default from config).
        #[arg(long)]
        method: Option<SearchMethod>,

        /// Restrict to one persona/domain.
        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        /// Context character budget.
        #[arg(long)]
        budget: Option<usize>,

        /// Print the raw response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Assemble the prompt context for one conversational turn.
    Context {
        /// The user's current message (enables knowledge retrieval).
        #[arg(long)]
        query: Option<String>,

        /// JSON file: an array of turns, or `{ "summary", "turns" }`.
        #[arg(long)]
        history: Option<PathBuf>,

        /// Rolling summary (overrides one from the history file).
        #[arg(long)]
        summary: Option<String>,

        #[arg(long)]
        method: Option<SearchMethod>,

        #[arg(long)]
        owner: Option<String>,

        /// Conversation token budget.
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Print the machine-readable trace instead of the rendered context.
        #[arg(long)]
        trace: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum DocsAction {
    /// Upsert documents from a JSON file (one document or an array).
    Add { file: PathBuf },
    /// List all documents.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let engine = Engine::open(&cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Docs { action } => match action {
            DocsAction::Add { file } => documents::run_docs_add(&engine, &file).await?,
            DocsAction::List => documents::run_docs_list(&engine).await?,
        },
        Commands::Reembed { target } => reembed::run_reembed(&engine, &target).await?,
        Commands::Missing => reembed::run_missing(&engine).await?,
        Commands::Search {
            query,
            method,
            owner,
            limit,
            budget,
            json,
        } => {
            let opts = SearchOptions {
                owner_tag: owner,
                method,
                max_results: limit,
                context_char_budget: budget,
            };
            search::run_search(&engine, &query, &opts, json).await?;
        }
        Commands::Context {
            query,
            history,
            summary,
            method,
            owner,
            max_tokens,
            trace,
        } => {
            let opts = SearchOptions {
                owner_tag: owner,
                method,
                ..SearchOptions::default()
            };
            context::run_context(
                &engine,
                query,
                history.as_deref(),
                summary,
                opts,
                max_tokens,
                trace,
            )
            .await?;
        }
        Commands::Serve => {
            server::run_server(engine).await?;
            return Ok(());
        }
    }

    engine.close().await;
    Ok(())
}
