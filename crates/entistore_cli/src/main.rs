//! EntiStore CLI
//!
//! Command-line tools for EntiStore maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and layout
//! - `verify` - Scan the entity log and check it against the TOC
//! - `shrink` - Compact the entity log to reclaim freed space
//! - `dump` - Print stored entities as JSON

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// EntiStore command-line tools.
#[derive(Parser)]
#[command(name = "entistore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and layout
    Inspect {
        /// List every active record
        #[arg(short, long)]
        entries: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify store integrity
    Verify,

    /// Compact the entity log
    Shrink {
        /// Dry run - show what would be reclaimed
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Print stored entities
    Dump {
        /// Only this entity
        #[arg(long)]
        id: Option<String>,

        /// Maximum number of entities to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { entries, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, entries, &format).await?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path).await?;
        }
        Commands::Shrink { dry_run } => {
            let path = cli.path.ok_or("Store path required for shrink")?;
            commands::shrink::run(&path, dry_run).await?;
        }
        Commands::Dump { id, limit, format } => {
            let path = cli.path.ok_or("Store path required for dump")?;
            commands::dump::run(&path, id.as_deref(), limit, &format).await?;
        }
        Commands::Version => commands::version::run(),
    }

    Ok(())
}
