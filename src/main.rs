//! # Second Brain CLI (`brain`)
//!
//! ## Usage
//!
//! ```bash
//! brain --config ./config/brain.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `brain recall "<query>"` | Run one retrieval pass and print the response as JSON |
//! | `brain chat "<query>"` | Run one planner turn and print the reply as JSON |
//! | `brain migrate status` | Show applied, pending and drifted migrations |
//! | `brain migrate apply` | Apply pending migrations |
//! | `brain migrate rollback` | Roll back the latest migration |
//! | `brain migrate lint` | Check migration SQL for destructive statements |
//! | `brain scenarios` | Run the branch validation scenarios |
//! | `brain ingest <dir>` | Chunk and store the markdown files in a directory |
//! | `brain chunk <id> --status <status>` | Archive, delete, restore or supersede a chunk |
//!
//! ## Examples
//!
//! ```bash
//! brain recall "what did I write about tokio" --mode fast --trace
//! brain migrate apply --dry-run
//! brain migrate lint --file migrations/003_add_tags.sql
//! brain scenarios --tag smoke
//! brain ingest ~/vault/inbox --dry-run
//! ```

use clap::{Parser, Subcommand};
use second_brain::commands::{self, IngestArgs, RecallArgs};
use second_brain::{config, logging};
use std::path::PathBuf;

/// Second Brain CLI: retrieval orchestration and migration safety.
///
/// The config file is optional; without it every setting takes its
/// default and retrieval runs on the deterministic fallback path.
#[derive(Parser)]
#[command(name = "brain", version, about = "Second Brain retrieval and migration tooling")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/brain.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one retrieval pass.
    Recall {
        query: String,

        /// Retrieval mode: `fast`, `accurate`, or `conversation`.
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of candidates.
        #[arg(long)]
        top_k: Option<usize>,

        /// Confidence threshold in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,

        /// Preferred provider: `mem0`, `supabase`, or `graphiti`.
        #[arg(long)]
        provider: Option<String>,

        /// Force a branch code (validation mode), e.g. `CHANNEL_MISMATCH`.
        #[arg(long)]
        force_branch: Option<String>,

        /// Print the recorded trace after the response.
        #[arg(long)]
        trace: bool,
    },

    /// Run one planner chat turn.
    Chat {
        query: String,

        /// Session id to continue; a new session is created when omitted.
        #[arg(long)]
        session: Option<String>,
    },

    /// Manage schema migrations.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Run the deterministic branch scenarios.
    Scenarios {
        /// Only run scenarios carrying this tag (`smoke`, `policy`, `edge`, `degraded`).
        #[arg(long)]
        tag: Option<String>,
    },

    /// Ingest the markdown files of a directory as knowledge chunks.
    Ingest {
        dir: PathBuf,

        /// Chunk and count without embedding or writing.
        #[arg(long)]
        dry_run: bool,

        /// Knowledge type recorded on documents and chunks (default `note`).
        #[arg(long = "type")]
        knowledge_type: Option<String>,

        /// Source origin, e.g. `obsidian` (default), `notion`, `manual`.
        #[arg(long)]
        origin: Option<String>,
    },

    /// Change the lifecycle status of one chunk.
    Chunk {
        id: String,

        /// Target status: `active`, `archived`, `deleted`, or `superseded`.
        #[arg(long)]
        status: String,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Show applied, pending and drifted migrations.
    Status,
    /// Apply all pending migrations in version order.
    Apply {
        /// List what would run without executing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Roll back the most recently applied migration.
    Rollback,
    /// Lint migration SQL. Exits 1 when any failure is found.
    Lint {
        /// Lint a single file instead of the migrations directory.
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_or_default(&cli.config)?;
    logging::init(&cfg.logging);

    let ok = match cli.command {
        Commands::Recall {
            query,
            mode,
            top_k,
            threshold,
            provider,
            force_branch,
            trace,
        } => {
            let args = RecallArgs {
                query,
                mode,
                top_k,
                threshold,
                provider,
                force_branch,
                trace,
            };
            commands::run_recall(&cfg, args).await?;
            true
        }
        Commands::Chat { query, session } => {
            commands::run_chat(&cfg, &query, session.as_deref()).await?;
            true
        }
        Commands::Migrate { action } => match action {
            MigrateAction::Status => {
                commands::run_migrate_status(&cfg).await?;
                true
            }
            MigrateAction::Apply { dry_run } => commands::run_migrate_apply(&cfg, dry_run).await?,
            MigrateAction::Rollback => commands::run_migrate_rollback(&cfg).await?,
            MigrateAction::Lint { file } => commands::run_lint(&cfg, file.as_deref())?,
        },
        Commands::Scenarios { tag } => commands::run_scenarios(tag.as_deref()).await?,
        Commands::Ingest {
            dir,
            dry_run,
            knowledge_type,
            origin,
        } => {
            let args = IngestArgs {
                dir,
                dry_run,
                knowledge_type,
                origin,
            };
            commands::run_ingest(&cfg, args).await?
        }
        Commands::Chunk { id, status } => {
            commands::run_chunk_status(&cfg, &id, &status).await?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
