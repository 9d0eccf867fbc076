//! # din CLI
//!
//! Ask questions of a SQLite store in plain language.
//!
//! ## Usage
//!
//! ```bash
//! din --config ./config/din.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `din init` | Create the application database and run migrations |
//! | `din describe <table>...` | Show the columns of store tables |
//! | `din link "<question>" -t <table>` | Print the schema link for a question |
//! | `din check "<question>" -t <table>` | Check a question for ambiguous terms |
//! | `din sql "<question>" -t <table>` | Synthesize and verify SQL |
//! | `din history <session>` | Show the turns of a disambiguation session |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use din_sql::{commands, config, migrate};

/// din: natural-language questions to verified SQL.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/din.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "din",
    about = "Natural-language questions to verified SQL",
    version,
    long_about = "din links a question to the columns of the tables it is asked about, \
    asks for clarification when a term is ambiguous, classifies and synthesizes SQL with a \
    text-completion model, and repairs the statement until it runs against the store."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/din.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the application database.
    ///
    /// Creates the SQLite file holding conversation sessions. Idempotent.
    Init,

    /// Show the columns of one or more store tables.
    Describe {
        /// Table names.
        #[arg(required = true)]
        tables: Vec<String>,
    },

    /// Print the schema link for a question.
    Link {
        question: String,
        /// Tables the question may reference (repeatable).
        #[arg(short = 't', long = "table", required = true)]
        tables: Vec<String>,
    },

    /// Check a question for ambiguous or unrecognized terms.
    ///
    /// With `--session`, the message joins a disambiguation session: it
    /// answers the pending clarification if there is one, and the full
    /// pipeline runs on the resulting question.
    Check {
        question: String,
        #[arg(short = 't', long = "table", required = true)]
        tables: Vec<String>,
        /// Session identifier.
        #[arg(long, conflicts_with = "new_session")]
        session: Option<String>,
        /// Start a new session with a generated identifier.
        #[arg(long)]
        new_session: bool,
    },

    /// Synthesize SQL for a question and verify it against the store.
    Sql {
        question: String,
        #[arg(short = 't', long = "table", required = true)]
        tables: Vec<String>,
        /// Also print the rows the statement returned, as JSON.
        #[arg(long)]
        rows: bool,
    },

    /// Show the turns of a disambiguation session.
    History { session: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Describe { tables } => {
            commands::run_describe(&cfg, &tables).await?;
        }
        Commands::Link { question, tables } => {
            commands::run_link(&cfg, &question, &tables).await?;
        }
        Commands::Check {
            question,
            tables,
            session,
            new_session,
        } => {
            let session = if new_session {
                let id = uuid::Uuid::new_v4().to_string();
                println!("Session: {}", id);
                Some(id)
            } else {
                session
            };
            commands::run_check(&cfg, &question, &tables, session.as_deref()).await?;
        }
        Commands::Sql {
            question,
            tables,
            rows,
        } => {
            commands::run_sql(&cfg, &question, &tables, rows).await?;
        }
        Commands::History { session } => {
            commands::run_history(&cfg, &session).await?;
        }
    }

    Ok(())
}
