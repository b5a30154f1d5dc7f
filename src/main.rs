//! # billsync CLI
//!
//! Fetches parliamentary bills from OpenParliament, enriches them from
//! LEGISinfo, reconciles them into SQLite by natural key and keeps an
//! audit trail of every run.
//!
//! ## Usage
//!
//! ```bash
//! billsync --config ./config/billsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `billsync init` | Create the SQLite database and schema |
//! | `billsync sync recent` | Ingest the most recently introduced bills |
//! | `billsync sync session` | Ingest every bill of one parliament session |
//! | `billsync bills` | List stored bills of a parliament |
//! | `billsync get` | Show one stored bill by natural key |
//! | `billsync logs` | Show recent fetch logs |
//! | `billsync monitor` | Aggregate run health over a time window |
//!
//! ## Examples
//!
//! ```bash
//! billsync init
//! billsync sync recent --limit 50
//! billsync sync session --parliament 44 --session 1 --no-enrich
//! billsync get canada-federal 44 1 C-10
//! RUST_LOG=parliament_ingest=debug billsync sync recent --since 2024-01-01
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use parliament_ingest::config::{self, Config};
use parliament_ingest::ingest::{self, SyncOptions};
use parliament_ingest::models::{NaturalKey, Selection};
use parliament_ingest::{get, migrate, stats};

#[derive(Parser)]
#[command(
    name = "billsync",
    about = "Fetch, enrich and reconcile parliamentary bill records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the file does not exist, built-in defaults are used with the
    /// database at `./data/billsync.sqlite`.
    #[arg(long, global = true, default_value = "./config/billsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run one ingestion pass and record it in the fetch log.
    Sync {
        #[command(subcommand)]
        mode: SyncMode,
    },

    /// List stored bills of a parliament, newest introduced first.
    Bills {
        #[arg(long)]
        parliament: i32,

        #[arg(long)]
        session: Option<i32>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one stored bill.
    Get {
        /// Jurisdiction code, e.g. `canada-federal`.
        jurisdiction: String,
        parliament: i32,
        session: i32,
        /// Bill number, e.g. `C-10`.
        number: String,
    },

    /// Show recent fetch logs.
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Only logs written by this source name.
        #[arg(long)]
        source: Option<String>,
    },

    /// Summarize run health over the last N hours.
    Monitor {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

#[derive(Subcommand)]
enum SyncMode {
    /// The most recently introduced bills.
    ///
    /// Without `--since`, the window starts at the newest bill seen by the
    /// last successful run (or `pipeline.fetch_window_days` ago).
    Recent {
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Skip the LEGISinfo enrichment step.
        #[arg(long)]
        no_enrich: bool,

        /// Only bills introduced on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
    },

    /// Every bill of one parliament session.
    Session {
        #[arg(long)]
        parliament: i32,

        #[arg(long)]
        session: i32,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        no_enrich: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::minimal())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}.", cfg.db.path.display());
        }
        Commands::Sync { mode } => {
            let options = match mode {
                SyncMode::Recent {
                    limit,
                    no_enrich,
                    since,
                } => SyncOptions {
                    selection: Selection::recent(limit),
                    enrich: !no_enrich,
                    since: since.as_deref().map(ingest::parse_date).transpose()?,
                },
                SyncMode::Session {
                    parliament,
                    session,
                    limit,
                    no_enrich,
                } => {
                    let mut selection = Selection::session(parliament, session);
                    if let Some(limit) = limit {
                        selection = selection.with_limit(limit);
                    }
                    SyncOptions {
                        selection,
                        enrich: !no_enrich,
                        since: None,
                    }
                }
            };
            ingest::run_sync(&cfg, options).await?;
        }
        Commands::Bills {
            parliament,
            session,
            limit,
        } => {
            get::run_bills(&cfg, parliament, session, limit).await?;
        }
        Commands::Get {
            jurisdiction,
            parliament,
            session,
            number,
        } => {
            let key = NaturalKey::new(jurisdiction, parliament, session, number.to_uppercase());
            get::run_get(&cfg, &key).await?;
        }
        Commands::Logs { limit, source } => {
            stats::run_logs(&cfg, limit, source.as_deref()).await?;
        }
        Commands::Monitor { hours } => {
            stats::run_monitor(&cfg, hours).await?;
        }
    }

    Ok(())
}
