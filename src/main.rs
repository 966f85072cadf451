//! # Sync Harness CLI (`shx`)
//!
//! ## Usage
//!
//! ```bash
//! shx --config ./config/shx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shx init` | Create the SQLite database and run schema migrations |
//! | `shx sources` | List configured sources and their connectors |
//! | `shx sync [source...]` | Run one sync cycle in the foreground |
//! | `shx status` | Per-source health, watermark age, cache counts |
//! | `shx trigger <source>` | Enqueue an out-of-schedule cycle for the workers |
//! | `shx search "<query>" --as <identity>` | Permission-filtered hybrid search |
//! | `shx worker` | Run the scheduler and worker pool until Ctrl-C |
//! | `shx sweep` | Drop archived fetch-cache batches past retention |
//! | `shx serve` | Start the operational HTTP server |
//! | `shx completions <shell>` | Print shell completions |

use std::io;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use sync_harness::config;
use sync_harness::logging::{self, LogFormat};
use sync_harness::{ingest, migrate, scheduler, search, server, sources, status};
use sync_harness_core::models::SourceType;

/// Sync Harness: scheduled, crash-safe ingestion into a permission-filtered
/// hybrid search index.
#[derive(Parser)]
#[command(name = "shx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shx.toml")]
    config: PathBuf,

    /// Log output format. Logs go to stderr; `RUST_LOG` overrides the filter.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it against an existing database is safe.
    Init,

    /// List configured sources and their connectors.
    Sources,

    /// Run one sync cycle per source in the foreground.
    ///
    /// With no arguments every configured source is synced.
    Sync {
        /// Source types, e.g. `chat`, `issue_tracker`.
        sources: Vec<SourceType>,
    },

    /// Show per-source health.
    Status,

    /// Enqueue an out-of-schedule cycle for a source.
    Trigger {
        source: SourceType,
    },

    /// Search the index as a caller identity.
    Search {
        query: String,

        /// Caller identity resolved through `[access.principals]`.
        /// Without it only public entries are returned.
        #[arg(long = "as")]
        identity: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run the scheduler beat and worker pool until Ctrl-C.
    Worker,

    /// Drop archived fetch-cache batches past the retention window.
    Sweep {
        /// Limit the sweep to one source.
        #[arg(long)]
        source: Option<SourceType>,
    },

    /// Start the operational HTTP server.
    Serve,

    /// Print shell completions.
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "shx", &mut io::stdout());
        return Ok(());
    }

    logging::init(cli.log_format)?;
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Sync { sources } => {
            ingest::run_sync(cfg, sources).await?;
        }
        Commands::Status => {
            status::run_status(cfg).await?;
        }
        Commands::Trigger { source } => {
            status::run_trigger(cfg, source).await?;
        }
        Commands::Search {
            query,
            identity,
            limit,
        } => {
            search::run_search(cfg, &query, identity.as_deref(), limit).await?;
        }
        Commands::Worker => {
            scheduler::run_worker(cfg).await?;
        }
        Commands::Sweep { source } => {
            status::run_sweep(cfg, source).await?;
        }
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
